use log::warn;
use thiserror::Error;
use crate::auth;
use crate::config::file;
use crate::context::{GalleryCoordinates, NetworkSettings, PollingSettings};
use crate::poll::Policy;
use crate::script::{self, GeneralizationScript};

#[derive(Error, Debug)]
pub enum Error {
    #[error("--gallery-deploy requires --gallery-name and --image-definition")]
    MissingGalleryCoordinates,

    #[error("no subscription given; use --subscription, AZURE_SUBSCRIPTION_ID or azure.subscription")]
    MissingSubscription,

    #[error("generalization script: {0}")]
    Script(#[from] script::Error),
}

#[derive(clap::Args, Debug, Clone, Default)]
pub struct Params {
    /// Name of the VM to capture. It is never modified.
    #[arg(long)]
    pub vm_name: String,

    /// Resource group of the VM to capture.
    #[arg(long)]
    pub resource_group: String,

    #[arg(long, env = "AZURE_SUBSCRIPTION_ID")]
    pub subscription: Option<String>,

    /// URI of the script that generalizes the temporary VM and shuts it down
    /// [default: script_uri from the configuration file, else a bundled script]
    #[arg(long)]
    pub script_uri: Option<String>,

    /// Refuse to run the script unless its SHA-256 matches; the checked copy
    /// is what the VM runs.
    #[arg(long)]
    pub script_sha256: Option<String>,

    /// Publish the captured image as a new version of a gallery image definition.
    #[arg(long)]
    pub gallery_deploy: bool,

    #[arg(long)]
    pub gallery_name: Option<String>,

    /// Image definition in the gallery. Must already exist.
    #[arg(long)]
    pub image_definition: Option<String>,

    /// Resource group of the gallery [default: --resource-group]
    #[arg(long)]
    pub gallery_resource_group: Option<String>,

    /// Keep the snapshot of the source OS disk after the run.
    #[arg(long)]
    pub keep_snapshot: bool,

    /// Major component of the image version [default: image_version_major from the configuration file]
    #[arg(long)]
    pub image_version_major: Option<u32>,
}

/// Everything a capture run needs, validated.
#[derive(Debug, Clone)]
pub struct Config {
    pub vm_name: String,
    pub resource_group: String,
    pub subscription: String,
    pub script: GeneralizationScript,
    pub gallery: Option<GalleryCoordinates>,
    pub delete_source_snapshot: bool,
    pub image_version_major: u32,
    pub polling: PollingSettings,
    pub operation_policy: Policy,
    pub network: NetworkSettings,
    pub azure: auth::Config,
}

impl Config {
    pub fn new(file: &file::File, params: Params) -> Result<Self, Error> {
        let subscription = params
            .subscription
            .or_else(|| file.azure.subscription.clone())
            .filter(|subscription| !subscription.is_empty())
            .ok_or(Error::MissingSubscription)?;

        let script = GeneralizationScript::new(
            params.script_uri.as_deref().or(file.script_uri.as_deref()),
            params.script_sha256.as_deref(),
        )?;

        let gallery = if params.gallery_deploy {
            let (Some(gallery), Some(definition)) = (params.gallery_name, params.image_definition) else {
                return Err(Error::MissingGalleryCoordinates);
            };
            Some(GalleryCoordinates {
                resource_group: params
                    .gallery_resource_group
                    .unwrap_or_else(|| params.resource_group.clone()),
                gallery,
                definition,
            })
        } else {
            if params.gallery_name.is_some() || params.image_definition.is_some() {
                warn!("Gallery parameters are ignored without --gallery-deploy");
            }
            None
        };

        Ok(Self {
            vm_name: params.vm_name,
            resource_group: params.resource_group,
            subscription,
            script,
            gallery,
            delete_source_snapshot: !params.keep_snapshot,
            image_version_major: params.image_version_major.unwrap_or(file.image_version_major),
            polling: file.polling.settings(),
            operation_policy: file.polling.operation_policy(),
            network: NetworkSettings::from(&file.network),
            azure: auth::Config {
                authority_host: file.azure.authority_host.clone(),
                management_endpoint: file.azure.management_endpoint.clone(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> Params {
        Params {
            vm_name: "web01".into(),
            resource_group: "rg-prod".into(),
            subscription: Some("00000000-0000-0000-0000-000000000000".into()),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_from_file() {
        let file = file::File::default();
        let cfg = Config::new(&file, params()).unwrap();

        assert_eq!(cfg.script, GeneralizationScript::Bundled);
        assert_eq!(cfg.gallery, None);
        assert!(cfg.delete_source_snapshot);
        assert_eq!(cfg.image_version_major, 1);
        assert_eq!(cfg.polling, PollingSettings::default());
        assert_eq!(cfg.azure.management_endpoint, "https://management.azure.com");
    }

    #[test]
    fn gallery_needs_name_and_definition() {
        let file = file::File::default();
        let incomplete = Params {
            gallery_deploy: true,
            gallery_name: Some("gal1".into()),
            ..params()
        };
        assert!(matches!(
            Config::new(&file, incomplete),
            Err(Error::MissingGalleryCoordinates)
        ));

        let complete = Params {
            gallery_deploy: true,
            gallery_name: Some("gal1".into()),
            image_definition: Some("def1".into()),
            ..params()
        };
        let gallery = Config::new(&file, complete).unwrap().gallery.unwrap();
        assert_eq!(gallery.resource_group, "rg-prod");
        assert_eq!(gallery.gallery, "gal1");
        assert_eq!(gallery.definition, "def1");
    }

    #[test]
    fn gallery_resource_group_can_differ() {
        let file = file::File::default();
        let cfg = Config::new(
            &file,
            Params {
                gallery_deploy: true,
                gallery_name: Some("gal1".into()),
                image_definition: Some("def1".into()),
                gallery_resource_group: Some("rg-images".into()),
                ..params()
            },
        )
        .unwrap();
        assert_eq!(cfg.gallery.unwrap().resource_group, "rg-images");
    }

    #[test]
    fn gallery_parameters_without_deploy_are_ignored() {
        let file = file::File::default();
        let cfg = Config::new(
            &file,
            Params {
                gallery_name: Some("gal1".into()),
                ..params()
            },
        )
        .unwrap();
        assert_eq!(cfg.gallery, None);
    }

    #[test]
    fn subscription_is_required() {
        let file = file::File::default();
        let no_subscription = Params {
            subscription: None,
            ..params()
        };
        assert!(matches!(
            Config::new(&file, no_subscription),
            Err(Error::MissingSubscription)
        ));
    }

    #[test]
    fn overrides_from_params() {
        let file = file::File::default();
        let cfg = Config::new(
            &file,
            Params {
                script_uri: Some("https://example.org/generalize.sh".into()),
                script_sha256: Some("0".repeat(64)),
                keep_snapshot: true,
                image_version_major: Some(4),
                ..params()
            },
        )
        .unwrap();
        assert!(matches!(
            cfg.script,
            GeneralizationScript::Remote { ref file_name, sha256: Some(_), .. } if file_name == "generalize.sh"
        ));
        assert!(!cfg.delete_source_snapshot);
        assert_eq!(cfg.image_version_major, 4);
    }

    #[test]
    fn bad_script_hash_is_rejected() {
        let file = file::File::default();
        let cfg = Config::new(
            &file,
            Params {
                script_sha256: Some("not-a-hash".into()),
                ..params()
            },
        );
        assert!(matches!(cfg, Err(Error::Script(script::Error::InvalidHash(_)))));
    }

    #[test]
    fn pinned_hash_needs_a_script_uri() {
        let file = file::File::default();
        let cfg = Config::new(
            &file,
            Params {
                script_sha256: Some("0".repeat(64)),
                ..params()
            },
        );
        assert!(matches!(cfg, Err(Error::Script(script::Error::PinWithoutUri))));
    }

    #[test]
    fn script_uri_from_file_is_used() {
        let mut file = file::File::default();
        file.script_uri = Some("https://example.org/scripts/generalize.ps1".into());
        let cfg = Config::new(&file, params()).unwrap();
        assert!(matches!(
            cfg.script,
            GeneralizationScript::Remote { ref uri, sha256: None, .. } if uri == "https://example.org/scripts/generalize.ps1"
        ));
    }
}
