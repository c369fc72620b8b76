use chrono::NaiveDateTime;
use log::info;
use crate::config::runtime;
use crate::gateway::{self, CloudGateway, ImageDefinition};
use crate::naming::{self, Names};
use crate::poll::Policy;
use crate::resources::ResourceId;
use crate::script::VerifiedScript;

/// Where a captured image is published, as given by the operator.
#[derive(Debug, Clone, PartialEq)]
pub struct GalleryCoordinates {
    pub resource_group: String,
    pub gallery: String,
    pub definition: String,
}

/// Gallery coordinates whose image definition is known to exist.
/// Only [`GalleryTarget::resolve`] creates one.
#[derive(Debug, Clone, PartialEq)]
pub struct GalleryTarget {
    coordinates: GalleryCoordinates,
    definition: ImageDefinition,
}

impl GalleryTarget {
    /// Look the image definition up. Runs before anything is created, so a
    /// failure here needs no cleanup.
    pub async fn resolve<G: CloudGateway + ?Sized>(
        gateway: &G,
        coordinates: GalleryCoordinates,
    ) -> Result<Self, gateway::Error> {
        let definition = gateway
            .get_image_definition(
                &coordinates.resource_group,
                &coordinates.gallery,
                &coordinates.definition,
            )
            .await?;
        info!("Image definition found in {}: {}", definition.location, definition.id);
        Ok(Self {
            coordinates,
            definition,
        })
    }

    pub fn resource_group(&self) -> &str {
        &self.coordinates.resource_group
    }

    pub fn gallery(&self) -> &str {
        &self.coordinates.gallery
    }

    pub fn definition(&self) -> &str {
        &self.coordinates.definition
    }

    pub fn definition_id(&self) -> &ResourceId {
        &self.definition.id
    }

    /// The gallery's location, where new versions must be created.
    pub fn location(&self) -> &str {
        &self.definition.location
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkSettings {
    pub address_prefix: String,
    pub subnet_prefix: String,
    /// Defaults to the port matching the source VM's OS.
    pub remote_admin_port: Option<u16>,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            address_prefix: "10.0.0.0/16".into(),
            subnet_prefix: "10.0.0.0/24".into(),
            remote_admin_port: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollingSettings {
    /// Temporary VM reaching "running" after creation.
    pub running: Policy,
    /// Temporary VM stopping once generalization shuts the guest down.
    pub stopped: Policy,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            running: Policy::from_secs(30, 7),
            stopped: Policy::from_secs(15, 11),
        }
    }
}

/// Everything fixed for the lifetime of one capture run.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub source_vm: String,
    pub source_resource_group: String,
    pub names: Names,
    pub gallery: Option<GalleryTarget>,
    pub script: VerifiedScript,
    pub delete_source_snapshot: bool,
    pub network: NetworkSettings,
    pub polling: PollingSettings,
}

impl BuildContext {
    pub fn new(
        cfg: &runtime::Config,
        built_at: NaiveDateTime,
        gallery: Option<GalleryTarget>,
        script: VerifiedScript,
    ) -> Result<Self, naming::Error> {
        Ok(Self {
            source_vm: cfg.vm_name.clone(),
            source_resource_group: cfg.resource_group.clone(),
            names: Names::derive(&cfg.vm_name, built_at, cfg.image_version_major)?,
            gallery,
            script,
            delete_source_snapshot: cfg.delete_source_snapshot,
            network: cfg.network.clone(),
            polling: cfg.polling,
        })
    }

    /// Publish the captured image to a gallery.
    pub fn catalog_deploy(&self) -> bool {
        self.gallery.is_some()
    }

    /// Resource group the captured image is written to: the temporary group
    /// when it is published to a gallery afterwards, the source group otherwise.
    pub fn image_resource_group(&self) -> &str {
        if self.catalog_deploy() {
            &self.names.resource_group
        } else {
            &self.source_resource_group
        }
    }
}
