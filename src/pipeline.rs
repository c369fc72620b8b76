//! Capture a generalized image from a running VM without touching the VM.
//!
//! The source OS disk is snapshotted, the snapshot is turned into a disk, and a
//! temporary VM boots from that disk in its own resource group and network.
//! A script generalizes the temporary VM and shuts it down, the VM is marked
//! generalized and captured as an image, and the image is optionally published
//! to a gallery. Temporary resources are removed at the end, whatever the outcome.
use log::{info, warn};
use thiserror::Error;
use crate::cleanup::{CleanupCoordinator, CleanupPlan, CleanupReport};
use crate::context::BuildContext;
use crate::gateway::{
    self, CloudGateway, DiskSpec, ImageSpec, ImageVersionSpec, NetworkInterfaceSpec,
    PublicAddressSpec, ScriptExtensionSpec, ScriptPayload, SecurityGroupSpec, SnapshotSpec,
    SourceVm, VirtualNetworkSpec, VmSpec,
};
use crate::poll;
use crate::resources::{CaptureResources, ResourceId, ResourceKind};
use crate::script;

const EXTENSION_NAME: &str = "Generalize";

/// Pipeline progress. Steps move through these strictly in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Initialized,
    SnapshotCreated,
    TempGroupCreated,
    DiskCreated,
    NetworkingCreated,
    VmCreated,
    VmRunningConfirmed,
    SysprepApplied,
    VmStoppedConfirmed,
    Generalized,
    ImageCaptured,
    CatalogPublished,
    /// Cleanup ran and every deletion succeeded, after success or failure.
    CleanedUp,
    /// Cleanup could not remove everything; the operator has to finish it.
    Aborted,
}

impl PipelineState {
    /// The state reached when the step following `self` succeeds.
    pub fn next(self, catalog_deploy: bool) -> Option<Self> {
        use PipelineState::*;
        Some(match self {
            Initialized => SnapshotCreated,
            SnapshotCreated => TempGroupCreated,
            TempGroupCreated => DiskCreated,
            DiskCreated => NetworkingCreated,
            NetworkingCreated => VmCreated,
            VmCreated => VmRunningConfirmed,
            VmRunningConfirmed => SysprepApplied,
            SysprepApplied => VmStoppedConfirmed,
            VmStoppedConfirmed => Generalized,
            Generalized => ImageCaptured,
            ImageCaptured if catalog_deploy => CatalogPublished,
            ImageCaptured | CatalogPublished => CleanedUp,
            CleanedUp | Aborted => return None,
        })
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("generalization script does not suit the source VM: {0}")]
    UnsuitableScript(#[source] script::Error),

    #[error("snapshot source disk: {0}")]
    Snapshot(#[source] gateway::Error),

    #[error("create temporary resource group: {0}")]
    ResourceGroup(#[source] gateway::Error),

    #[error("create OS disk from snapshot: {0}")]
    Disk(#[source] gateway::Error),

    #[error("create temporary {resource}: {source}")]
    Networking {
        resource: ResourceKind,
        source: gateway::Error,
    },

    #[error("create temporary VM: {0}")]
    VmProvision(#[source] gateway::Error),

    #[error("wait for temporary VM to run: {0}")]
    VmNotReady(poll::Error<gateway::Error>),

    #[error("run generalization script: {0}")]
    Extension(#[source] gateway::Error),

    #[error("wait for temporary VM to stop: {0}; verify that no pending OS updates blocked generalization")]
    VmNotStopped(poll::Error<gateway::Error>),

    #[error("deallocate and generalize temporary VM: {0}")]
    Generalize(#[source] gateway::Error),

    #[error("capture image: {0}")]
    ImageCapture(#[source] gateway::Error),

    #[error("publish image version: {0}")]
    CatalogPublish(#[source] gateway::Error),

    #[error("{step} cannot run in state {state:?}")]
    OutOfOrder {
        step: &'static str,
        state: PipelineState,
    },
}

/// The products of a successful run.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub image: ResourceId,
    pub image_version: Option<ResourceId>,
}

/// How a run ended: the forward result and, separately, what cleanup did.
#[derive(Debug)]
pub struct Report {
    pub result: Result<Outcome, Error>,
    pub cleanup: CleanupReport,
    pub state: PipelineState,
    pub resources: CaptureResources,
}

pub struct CapturePipeline<'a, G: CloudGateway + ?Sized> {
    gateway: &'a G,
    context: BuildContext,
    state: PipelineState,
    resources: CaptureResources,
    source: Option<SourceVm>,
    payload: Option<ScriptPayload>,
}

impl<'a, G: CloudGateway + ?Sized> CapturePipeline<'a, G> {
    pub fn new(gateway: &'a G, context: BuildContext) -> Self {
        Self {
            gateway,
            context,
            state: PipelineState::Initialized,
            resources: CaptureResources::new(),
            source: None,
            payload: None,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn resources(&self) -> &CaptureResources {
        &self.resources
    }

    /// Run every step, then clean up.
    pub async fn run(mut self) -> Report {
        let result = self.forward().await;
        if let Err(err) = &result {
            warn!("Capture failed, cleaning up: {err}");
        }
        let cleanup = self.cleanup(result.as_ref().err()).await;
        Report {
            result,
            cleanup,
            state: self.state,
            resources: self.resources,
        }
    }

    async fn forward(&mut self) -> Result<Outcome, Error> {
        self.snapshot_source_disk().await?;
        self.create_temp_group().await?;
        self.create_os_disk().await?;
        self.provision_networking().await?;
        self.create_vm().await?;
        self.wait_for_running().await?;
        self.apply_generalization().await?;
        self.wait_for_stopped().await?;
        self.generalize().await?;
        let image = self.capture_image().await?;
        let image_version = if self.context.catalog_deploy() {
            Some(self.publish_to_gallery().await?)
        } else {
            None
        };
        Ok(Outcome {
            image,
            image_version,
        })
    }

    fn begin(&self, step: &'static str, expected: PipelineState) -> Result<(), Error> {
        if self.state != expected {
            return Err(Error::OutOfOrder {
                step,
                state: self.state,
            });
        }
        info!("{step}");
        Ok(())
    }

    fn advance(&mut self, to: PipelineState) {
        debug_assert_eq!(self.state.next(self.context.catalog_deploy()), Some(to));
        self.state = to;
    }

    fn record(&mut self, kind: ResourceKind, id: ResourceId) {
        info!("Created {kind} {id}");
        self.resources.record(kind, id);
    }

    fn source(&self, step: &'static str) -> Result<&SourceVm, Error> {
        self.source.as_ref().ok_or(Error::OutOfOrder {
            step,
            state: self.state,
        })
    }

    fn recorded(&self, kind: ResourceKind, step: &'static str) -> Result<&ResourceId, Error> {
        self.resources.get(kind).ok_or(Error::OutOfOrder {
            step,
            state: self.state,
        })
    }

    /// Step 1: copy the source VM's OS disk into a snapshot next to it.
    /// A script that cannot run on the source's OS fails here, before
    /// anything is created.
    pub async fn snapshot_source_disk(&mut self) -> Result<(), Error> {
        self.begin("Snapshotting source disk", PipelineState::Initialized)?;
        let ctx = &self.context;

        let source = self
            .gateway
            .get_vm(&ctx.source_resource_group, &ctx.source_vm)
            .await
            .map_err(Error::Snapshot)?;
        info!(
            "Source VM {} is a {} {} in {}",
            ctx.source_vm,
            source.size,
            source.os_type.as_str(),
            source.location
        );
        let payload = ctx
            .script
            .payload(source.os_type)
            .map_err(Error::UnsuitableScript)?;

        let snapshot = self
            .gateway
            .create_snapshot(&SnapshotSpec {
                resource_group: &ctx.source_resource_group,
                name: &ctx.names.snapshot,
                location: &source.location,
                source_disk: &source.os_disk,
            })
            .await
            .map_err(Error::Snapshot)?;

        self.source = Some(source);
        self.payload = Some(payload);
        self.record(ResourceKind::Snapshot, snapshot);
        self.advance(PipelineState::SnapshotCreated);
        Ok(())
    }

    /// Step 2: an empty group that holds everything built from here on.
    pub async fn create_temp_group(&mut self) -> Result<(), Error> {
        const STEP: &str = "Creating temporary resource group";
        self.begin(STEP, PipelineState::SnapshotCreated)?;
        let source = self.source(STEP)?;

        let group = self
            .gateway
            .create_resource_group(&self.context.names.resource_group, &source.location)
            .await
            .map_err(Error::ResourceGroup)?;

        self.record(ResourceKind::ResourceGroup, group);
        self.advance(PipelineState::TempGroupCreated);
        Ok(())
    }

    /// Step 3: a managed disk with the snapshot's content, in the temporary group.
    pub async fn create_os_disk(&mut self) -> Result<(), Error> {
        const STEP: &str = "Creating OS disk from snapshot";
        self.begin(STEP, PipelineState::TempGroupCreated)?;
        let source = self.source(STEP)?;
        let snapshot = self.recorded(ResourceKind::Snapshot, STEP)?;
        let names = &self.context.names;

        let disk = self
            .gateway
            .create_disk_from_snapshot(&DiskSpec {
                resource_group: &names.resource_group,
                name: &names.disk,
                location: &source.location,
                os_type: source.os_type,
                snapshot,
            })
            .await
            .map_err(Error::Disk)?;

        self.record(ResourceKind::Disk, disk);
        self.advance(PipelineState::DiskCreated);
        Ok(())
    }

    /// Step 4: virtual network and subnet, security group, public address and
    /// the network interface that binds them.
    pub async fn provision_networking(&mut self) -> Result<(), Error> {
        const STEP: &str = "Provisioning temporary networking";
        self.begin(STEP, PipelineState::DiskCreated)?;
        let gateway = self.gateway;
        let ctx = &self.context;
        let names = &ctx.names;
        let source = self.source.as_ref().ok_or(Error::OutOfOrder {
            step: STEP,
            state: self.state,
        })?;
        let location = source.location.as_str();
        let networking =
            |resource: ResourceKind| move |source: gateway::Error| Error::Networking { resource, source };

        let vnet = gateway
            .create_virtual_network(&VirtualNetworkSpec {
                resource_group: &names.resource_group,
                name: &names.virtual_network,
                location,
                address_prefix: &ctx.network.address_prefix,
                subnet_name: &names.subnet,
                subnet_prefix: &ctx.network.subnet_prefix,
            })
            .await
            .map_err(networking(ResourceKind::VirtualNetwork))?;
        info!("Created {} {}", ResourceKind::VirtualNetwork, vnet.id);
        self.resources.record(ResourceKind::VirtualNetwork, vnet.id);

        let remote_admin_port = ctx
            .network
            .remote_admin_port
            .unwrap_or_else(|| source.os_type.remote_admin_port());
        warn!("Temporary security group allows port {remote_admin_port} from any source");
        let security_group = gateway
            .create_security_group(&SecurityGroupSpec {
                resource_group: &names.resource_group,
                name: &names.security_group,
                location,
                remote_admin_port,
            })
            .await
            .map_err(networking(ResourceKind::SecurityGroup))?;
        info!("Created {} {security_group}", ResourceKind::SecurityGroup);
        self.resources.record(ResourceKind::SecurityGroup, security_group.clone());

        let public_address = gateway
            .create_public_address(&PublicAddressSpec {
                resource_group: &names.resource_group,
                name: &names.public_address,
                location,
            })
            .await
            .map_err(networking(ResourceKind::PublicAddress))?;
        info!("Created {} {public_address}", ResourceKind::PublicAddress);
        self.resources.record(ResourceKind::PublicAddress, public_address.clone());

        let nic = gateway
            .create_network_interface(&NetworkInterfaceSpec {
                resource_group: &names.resource_group,
                name: &names.network_interface,
                location,
                subnet: &vnet.subnet,
                public_address: &public_address,
                security_group: &security_group,
            })
            .await
            .map_err(networking(ResourceKind::NetworkInterface))?;
        info!("Created {} {nic}", ResourceKind::NetworkInterface);
        self.resources.record(ResourceKind::NetworkInterface, nic);

        self.advance(PipelineState::NetworkingCreated);
        Ok(())
    }

    /// Step 5: a VM of the source's size booting from the copied disk.
    /// Creating the VM starts it.
    pub async fn create_vm(&mut self) -> Result<(), Error> {
        const STEP: &str = "Creating temporary VM";
        self.begin(STEP, PipelineState::NetworkingCreated)?;
        let source = self.source(STEP)?;
        let names = &self.context.names;

        let vm = self
            .gateway
            .create_vm(&VmSpec {
                resource_group: &names.resource_group,
                name: &names.virtual_machine,
                location: &source.location,
                size: &source.size,
                os_type: source.os_type,
                os_disk: self.recorded(ResourceKind::Disk, STEP)?,
                network_interface: self.recorded(ResourceKind::NetworkInterface, STEP)?,
            })
            .await
            .map_err(Error::VmProvision)?;

        self.record(ResourceKind::VirtualMachine, vm);
        self.advance(PipelineState::VmCreated);
        Ok(())
    }

    /// Step 6
    pub async fn wait_for_running(&mut self) -> Result<(), Error> {
        self.begin("Waiting for temporary VM to run", PipelineState::VmCreated)?;
        let policy = self.context.polling.running;
        self.wait_for_status(policy, gateway::VmStatus::is_running)
            .await
            .map_err(Error::VmNotReady)?;

        info!("Temporary VM {} is running", self.context.names.virtual_machine);
        self.advance(PipelineState::VmRunningConfirmed);
        Ok(())
    }

    /// Step 7: issue the generalization script. Its completion is only
    /// observed through the VM stopping.
    pub async fn apply_generalization(&mut self) -> Result<(), Error> {
        const STEP: &str = "Running generalization script";
        self.begin(STEP, PipelineState::VmRunningConfirmed)?;
        let source = self.source(STEP)?;
        let ctx = &self.context;
        let payload = self.payload.as_ref().ok_or(Error::OutOfOrder {
            step: STEP,
            state: self.state,
        })?;

        info!("Running {} inside {}", ctx.script, ctx.names.virtual_machine);
        self.gateway
            .run_script_extension(&ScriptExtensionSpec {
                resource_group: &ctx.names.resource_group,
                vm_name: &ctx.names.virtual_machine,
                location: &source.location,
                os_type: source.os_type,
                name: EXTENSION_NAME,
                payload,
            })
            .await
            .map_err(Error::Extension)?;

        self.advance(PipelineState::SysprepApplied);
        Ok(())
    }

    /// Step 8: generalization shuts the guest down when it is done.
    pub async fn wait_for_stopped(&mut self) -> Result<(), Error> {
        self.begin("Waiting for temporary VM to stop", PipelineState::SysprepApplied)?;
        let policy = self.context.polling.stopped;
        self.wait_for_status(policy, gateway::VmStatus::is_stopped)
            .await
            .map_err(Error::VmNotStopped)?;

        info!("Temporary VM {} has stopped", self.context.names.virtual_machine);
        self.advance(PipelineState::VmStoppedConfirmed);
        Ok(())
    }

    /// Step 9
    pub async fn generalize(&mut self) -> Result<(), Error> {
        self.begin("Deallocating and generalizing temporary VM", PipelineState::VmStoppedConfirmed)?;
        let names = &self.context.names;

        self.gateway
            .deallocate_vm(&names.resource_group, &names.virtual_machine)
            .await
            .map_err(Error::Generalize)?;
        self.gateway
            .generalize_vm(&names.resource_group, &names.virtual_machine)
            .await
            .map_err(Error::Generalize)?;

        self.advance(PipelineState::Generalized);
        Ok(())
    }

    /// Step 10: the image goes to the temporary group when it is published
    /// afterwards, otherwise straight into the source group.
    pub async fn capture_image(&mut self) -> Result<ResourceId, Error> {
        const STEP: &str = "Capturing image";
        self.begin(STEP, PipelineState::Generalized)?;
        let source = self.source(STEP)?;
        let ctx = &self.context;

        let generation = self
            .gateway
            .get_vm_generation(&ctx.names.resource_group, &ctx.names.virtual_machine)
            .await
            .map_err(Error::ImageCapture)?;
        let image = self
            .gateway
            .create_image(&ImageSpec {
                resource_group: ctx.image_resource_group(),
                name: &ctx.names.image,
                location: &source.location,
                source_vm: self.recorded(ResourceKind::VirtualMachine, STEP)?,
                generation,
            })
            .await
            .map_err(Error::ImageCapture)?;

        self.record(ResourceKind::Image, image.clone());
        self.advance(PipelineState::ImageCaptured);
        Ok(image)
    }

    /// Step 11, only when publishing to a gallery.
    pub async fn publish_to_gallery(&mut self) -> Result<ResourceId, Error> {
        const STEP: &str = "Publishing image version";
        self.begin(STEP, PipelineState::ImageCaptured)?;
        let source = self.source(STEP)?;
        let ctx = &self.context;
        let Some(gallery) = &ctx.gallery else {
            return Err(Error::OutOfOrder {
                step: STEP,
                state: self.state,
            });
        };

        info!(
            "Publishing {} as version {} of {} in {}",
            ctx.names.image,
            ctx.names.image_version,
            gallery.definition_id(),
            gallery.location()
        );
        let version = self
            .gateway
            .create_image_version(&ImageVersionSpec {
                resource_group: gallery.resource_group(),
                gallery: gallery.gallery(),
                definition: gallery.definition(),
                version: &ctx.names.image_version,
                location: gallery.location(),
                source_region: &source.location,
                source_image: self.recorded(ResourceKind::Image, STEP)?,
            })
            .await
            .map_err(Error::CatalogPublish)?;

        self.record(ResourceKind::ImageVersion, version.clone());
        self.advance(PipelineState::CatalogPublished);
        Ok(version)
    }

    /// Step 12: remove the temporary group and, if configured, the snapshot.
    ///
    /// After a failed publish the temporary group holds the only copy of the
    /// captured image, so it is kept for manual recovery.
    pub async fn cleanup(&mut self, failure: Option<&Error>) -> CleanupReport {
        info!("Cleaning up");
        let plan = CleanupPlan {
            delete_resource_group: !matches!(failure, Some(Error::CatalogPublish(_))),
            delete_snapshot: self.context.delete_source_snapshot,
        };
        let report = CleanupCoordinator::new(self.gateway)
            .run(&self.resources, plan)
            .await;
        self.state = if report.is_clean() {
            PipelineState::CleanedUp
        } else {
            PipelineState::Aborted
        };
        report
    }

    async fn wait_for_status(
        &self,
        policy: poll::Policy,
        reached: fn(&gateway::VmStatus) -> bool,
    ) -> Result<(), poll::Error<gateway::Error>> {
        let gateway = self.gateway;
        let resource_group = self.context.names.resource_group.as_str();
        let vm_name = self.context.names.virtual_machine.as_str();

        poll::wait_for(policy, move || async move {
            let status = gateway.get_vm_status(resource_group, vm_name).await?;
            info!(
                "Temporary VM status: {}, {}",
                status.power.as_deref().unwrap_or("unknown"),
                status.provisioning.as_deref().unwrap_or("provisioning state unknown")
            );
            Ok::<_, gateway::Error>(reached(&status))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};
    use crate::context::{GalleryCoordinates, GalleryTarget, NetworkSettings, PollingSettings};
    use base64::{engine::general_purpose, Engine};
    use crate::gateway::fake::FakeGateway;
    use crate::gateway::OsType;
    use crate::naming::Names;
    use crate::script::{GeneralizationScript, VerifiedScript};

    const SCRIPT: &str = "https://example.org/scripts/generalize.ps1";

    fn built_at() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, 19)
            .unwrap()
            .and_hms_opt(15, 42, 0)
            .unwrap()
    }

    fn context(gallery: Option<GalleryTarget>) -> BuildContext {
        BuildContext {
            source_vm: "web01".into(),
            source_resource_group: "rg-prod".into(),
            names: Names::derive("web01", built_at(), 1).unwrap(),
            gallery,
            script: VerifiedScript::Bundled,
            delete_source_snapshot: true,
            network: NetworkSettings::default(),
            polling: PollingSettings::default(),
        }
    }

    async fn gallery(gateway: &FakeGateway) -> GalleryTarget {
        GalleryTarget::resolve(
            gateway,
            GalleryCoordinates {
                resource_group: "rg-prod".into(),
                gallery: "gal1".into(),
                definition: "def1".into(),
            },
        )
        .await
        .unwrap()
    }

    const FORWARD_STEPS: [&str; 16] = [
        "get_vm",
        "create_snapshot",
        "create_resource_group",
        "create_disk_from_snapshot",
        "create_virtual_network",
        "create_security_group",
        "create_public_address",
        "create_network_interface",
        "create_vm",
        "get_vm_status",
        "get_vm_status",
        "run_script_extension",
        "get_vm_status",
        "get_vm_status",
        "deallocate_vm",
        "generalize_vm",
    ];

    #[test]
    fn states_advance_linearly() {
        let mut state = PipelineState::Initialized;
        let mut visited = vec![state];
        while let Some(next) = state.next(false) {
            state = next;
            visited.push(state);
        }
        assert_eq!(visited.len(), 12);
        assert_eq!(state, PipelineState::CleanedUp);
        assert!(!visited.contains(&PipelineState::CatalogPublished));

        assert_eq!(
            PipelineState::ImageCaptured.next(true),
            Some(PipelineState::CatalogPublished)
        );
        assert_eq!(PipelineState::Aborted.next(true), None);
    }

    #[tokio::test(start_paused = true)]
    async fn captures_into_source_group() {
        let gateway = FakeGateway::happy();
        let report = CapturePipeline::new(&gateway, context(None)).run().await;

        let outcome = report.result.unwrap();
        assert_eq!(outcome.image.name(), "web01Image202610191542");
        assert_eq!(outcome.image.resource_group(), Some("rg-prod"));
        assert_eq!(outcome.image_version, None);
        assert_eq!(report.state, PipelineState::CleanedUp);
        assert!(report.cleanup.is_clean());

        let mut expected: Vec<&str> = FORWARD_STEPS.to_vec();
        expected.extend(["get_vm_generation", "create_image", "delete_resource_group", "delete_snapshot"]);
        assert_eq!(gateway.operations(), expected);

        assert_eq!(gateway.calls_to("create_snapshot"), vec!["create_snapshot rg-prod/web01202610191542"]);
        assert_eq!(
            gateway.calls_to("create_resource_group"),
            vec!["create_resource_group web01202610191542_ImageRG"]
        );
        assert_eq!(
            gateway.calls_to("create_image"),
            vec!["create_image rg-prod/web01Image202610191542"]
        );
        assert_eq!(
            gateway.calls_to("delete_resource_group"),
            vec!["delete_resource_group web01202610191542_ImageRG"]
        );
        assert_eq!(gateway.calls_to("delete_snapshot"), vec!["delete_snapshot web01202610191542"]);
    }

    #[tokio::test(start_paused = true)]
    async fn captures_into_temp_group_and_publishes() {
        let gateway = FakeGateway::happy();
        let target = gallery(&gateway).await;
        let report = CapturePipeline::new(&gateway, context(Some(target))).run().await;

        let outcome = report.result.unwrap();
        assert_eq!(outcome.image.resource_group(), Some("web01202610191542_ImageRG"));
        assert_eq!(outcome.image_version.unwrap().name(), "1.202610.191542");
        assert_eq!(report.state, PipelineState::CleanedUp);

        assert_eq!(
            gateway.calls_to("create_image"),
            vec!["create_image web01202610191542_ImageRG/web01Image202610191542"]
        );
        assert_eq!(
            gateway.calls_to("create_image_version"),
            vec!["create_image_version rg-prod/gal1/def1/1.202610.191542 in westeurope from westeurope"]
        );
        let operations = gateway.operations();
        assert_eq!(
            &operations[operations.len() - 3..],
            ["create_image_version", "delete_resource_group", "delete_snapshot"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn vm_that_never_runs_aborts_and_cleans_up() {
        let gateway = FakeGateway::default().with_statuses(&["VM starting"]);
        let start = tokio::time::Instant::now();
        let report = CapturePipeline::new(&gateway, context(None)).run().await;

        assert!(matches!(
            report.result,
            Err(Error::VmNotReady(poll::Error::TimedOut { attempts: 7, .. }))
        ));
        assert_eq!(gateway.calls_to("get_vm_status").len(), 7);
        assert!(gateway.calls_to("run_script_extension").is_empty());
        assert_eq!(start.elapsed(), std::time::Duration::from_secs(6 * 30));

        let operations = gateway.operations();
        assert_eq!(
            &operations[operations.len() - 2..],
            ["delete_resource_group", "delete_snapshot"]
        );
        assert_eq!(report.state, PipelineState::CleanedUp);
    }

    #[tokio::test(start_paused = true)]
    async fn vm_that_never_stops_names_pending_updates() {
        let gateway = FakeGateway::default().with_statuses(&["VM running"]);
        let report = CapturePipeline::new(&gateway, context(None)).run().await;

        let err = report.result.unwrap_err();
        assert!(matches!(err, Error::VmNotStopped(poll::Error::TimedOut { attempts: 11, .. })));
        assert!(err.to_string().contains("pending OS updates"));
        assert_eq!(gateway.calls_to("get_vm_status").len(), 1 + 11);
        assert!(gateway.calls_to("deallocate_vm").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn status_read_error_is_not_retried() {
        let gateway = FakeGateway::happy().failing("get_vm_status");
        let report = CapturePipeline::new(&gateway, context(None)).run().await;

        assert!(matches!(report.result, Err(Error::VmNotReady(poll::Error::Read(_)))));
        assert_eq!(gateway.calls_to("get_vm_status").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_failure_leaves_nothing_to_clean() {
        let gateway = FakeGateway::happy().failing("create_snapshot");
        let report = CapturePipeline::new(&gateway, context(None)).run().await;

        assert!(matches!(report.result, Err(Error::Snapshot(_))));
        assert_eq!(gateway.operations(), vec!["get_vm", "create_snapshot"]);
        assert_eq!(report.resources.created().count(), 0);
        assert_eq!(report.state, PipelineState::CleanedUp);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_source_vm_fails_the_snapshot_step() {
        let mut ctx = context(None);
        ctx.source_vm = "web02".into();
        let gateway = FakeGateway::happy();
        let report = CapturePipeline::new(&gateway, ctx).run().await;

        assert!(matches!(report.result, Err(Error::Snapshot(ref err)) if err.is_not_found()));
        assert_eq!(gateway.operations(), vec!["get_vm"]);
    }

    #[tokio::test(start_paused = true)]
    async fn networking_failure_still_cleans_up() {
        let gateway = FakeGateway::happy().failing("create_public_address");
        let report = CapturePipeline::new(&gateway, context(None)).run().await;

        assert!(matches!(
            report.result,
            Err(Error::Networking {
                resource: ResourceKind::PublicAddress,
                ..
            })
        ));
        let created: Vec<_> = report.resources.created().map(|(kind, _)| kind).collect();
        assert_eq!(
            created,
            vec![
                ResourceKind::Snapshot,
                ResourceKind::ResourceGroup,
                ResourceKind::Disk,
                ResourceKind::VirtualNetwork,
                ResourceKind::SecurityGroup,
            ]
        );
        let operations = gateway.operations();
        assert_eq!(
            &operations[operations.len() - 2..],
            ["delete_resource_group", "delete_snapshot"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_publish_keeps_temp_group() {
        let gateway = FakeGateway::happy().failing("create_image_version");
        let target = gallery(&gateway).await;
        let report = CapturePipeline::new(&gateway, context(Some(target))).run().await;

        assert!(matches!(report.result, Err(Error::CatalogPublish(_))));
        assert!(gateway.calls_to("delete_resource_group").is_empty());
        assert_eq!(gateway.calls_to("delete_snapshot").len(), 1);
        assert_eq!(
            report.cleanup.retained,
            vec![report.resources.resource_group().unwrap().clone()]
        );
        assert!(report.resources.image().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_is_kept_when_asked() {
        let gateway = FakeGateway::happy();
        let mut ctx = context(None);
        ctx.delete_source_snapshot = false;
        let report = CapturePipeline::new(&gateway, ctx).run().await;

        assert!(report.result.is_ok());
        assert!(gateway.calls_to("delete_snapshot").is_empty());
        assert_eq!(gateway.calls_to("delete_resource_group").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_cleanup_aborts() {
        let gateway = FakeGateway::happy().failing("delete_resource_group");
        let report = CapturePipeline::new(&gateway, context(None)).run().await;

        assert!(report.result.is_ok());
        assert_eq!(report.state, PipelineState::Aborted);
        assert_eq!(report.cleanup.errors.len(), 1);
        // the snapshot is still attempted
        assert_eq!(gateway.calls_to("delete_snapshot").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn steps_refuse_to_run_out_of_order() {
        let gateway = FakeGateway::happy();
        let mut pipeline = CapturePipeline::new(&gateway, context(None));

        assert!(matches!(
            pipeline.create_temp_group().await,
            Err(Error::OutOfOrder {
                state: PipelineState::Initialized,
                ..
            })
        ));
        assert!(gateway.calls().is_empty());

        pipeline.snapshot_source_disk().await.unwrap();
        assert_eq!(pipeline.state(), PipelineState::SnapshotCreated);
        assert!(pipeline.resources().snapshot().is_some());
        assert!(pipeline.resources().resource_group().is_none());

        assert!(matches!(
            pipeline.snapshot_source_disk().await,
            Err(Error::OutOfOrder { .. })
        ));
        assert!(matches!(
            pipeline.publish_to_gallery().await,
            Err(Error::OutOfOrder { .. })
        ));

        pipeline.create_temp_group().await.unwrap();
        assert_eq!(pipeline.state(), PipelineState::TempGroupCreated);
        assert_eq!(
            pipeline.resources().resource_group().unwrap().name(),
            "web01202610191542_ImageRG"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_after_cleanup_is_a_no_op() {
        let gateway = FakeGateway::happy()
            .missing("web01202610191542_ImageRG")
            .missing("web01202610191542");
        let mut pipeline = CapturePipeline::new(&gateway, context(None));
        pipeline.snapshot_source_disk().await.unwrap();
        pipeline.create_temp_group().await.unwrap();

        let report = pipeline.cleanup(None).await;
        assert!(report.is_clean());
        assert_eq!(report.already_absent.len(), 2);
        assert_eq!(pipeline.state(), PipelineState::CleanedUp);
    }

    #[tokio::test(start_paused = true)]
    async fn version_is_created_in_the_gallery_location() {
        let gateway = FakeGateway::happy().with_gallery_location("northeurope");
        let target = gallery(&gateway).await;
        let report = CapturePipeline::new(&gateway, context(Some(target))).run().await;

        assert!(report.result.is_ok());
        assert_eq!(
            gateway.calls_to("create_image_version"),
            vec!["create_image_version rg-prod/gal1/def1/1.202610.191542 in northeurope from westeurope"]
        );
        // the image itself stays next to the source
        assert_eq!(gateway.calls_to("create_snapshot").len(), 1);
        assert_eq!(report.state, PipelineState::CleanedUp);
    }

    #[tokio::test(start_paused = true)]
    async fn pinned_script_is_sent_to_the_vm_as_checked() {
        let content = "Write-Output 'checked copy'\n";
        let script = GeneralizationScript::new(Some(SCRIPT), Some(sha256::digest(content.as_bytes()).as_str()))
            .unwrap()
            .check(content.as_bytes())
            .unwrap();
        let mut ctx = context(None);
        ctx.script = script;
        let gateway = FakeGateway::happy();
        let report = CapturePipeline::new(&gateway, ctx).run().await;
        assert!(report.result.is_ok());

        let payloads = gateway.script_payloads();
        let [ScriptPayload::Command(command)] = payloads.as_slice() else {
            panic!("expected one inline command, got {payloads:?}");
        };
        let encoded = command.rsplit(' ').next().unwrap();
        let utf16: Vec<u16> = general_purpose::STANDARD
            .decode(encoded)
            .unwrap()
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        assert_eq!(String::from_utf16(&utf16).unwrap(), content);
    }

    #[tokio::test(start_paused = true)]
    async fn powershell_script_on_linux_creates_nothing() {
        let mut gateway = FakeGateway::happy();
        gateway.source.os_type = OsType::Linux;
        let mut ctx = context(None);
        ctx.script = GeneralizationScript::new(Some(SCRIPT), None).unwrap().check(&[]).unwrap();
        let report = CapturePipeline::new(&gateway, ctx).run().await;

        assert!(matches!(
            report.result,
            Err(Error::UnsuitableScript(script::Error::Unsuitable { .. }))
        ));
        assert_eq!(gateway.operations(), vec!["get_vm"]);
        assert_eq!(report.state, PipelineState::CleanedUp);
    }

    #[tokio::test(start_paused = true)]
    async fn bundled_script_follows_the_source_os() {
        let mut gateway = FakeGateway::happy();
        gateway.source.os_type = OsType::Linux;
        let report = CapturePipeline::new(&gateway, context(None)).run().await;

        assert!(report.result.is_ok());
        assert!(matches!(gateway.script_payloads().as_slice(), [ScriptPayload::Script(_)]));
        assert_eq!(
            gateway.calls_to("run_script_extension"),
            vec!["run_script_extension web01202610191542_ImageRG/web01202610191542_VM"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn each_step_failure_is_reported_and_cleaned_up() {
        let cases: [(&'static str, fn(&Error) -> bool, usize); 10] = [
            ("create_resource_group", |err| matches!(err, Error::ResourceGroup(_)), 0),
            ("create_disk_from_snapshot", |err| matches!(err, Error::Disk(_)), 1),
            (
                "create_virtual_network",
                |err| matches!(err, Error::Networking { resource: ResourceKind::VirtualNetwork, .. }),
                1,
            ),
            (
                "create_network_interface",
                |err| matches!(err, Error::Networking { resource: ResourceKind::NetworkInterface, .. }),
                1,
            ),
            ("create_vm", |err| matches!(err, Error::VmProvision(_)), 1),
            ("run_script_extension", |err| matches!(err, Error::Extension(_)), 1),
            ("deallocate_vm", |err| matches!(err, Error::Generalize(_)), 1),
            ("generalize_vm", |err| matches!(err, Error::Generalize(_)), 1),
            ("get_vm_generation", |err| matches!(err, Error::ImageCapture(_)), 1),
            ("create_image", |err| matches!(err, Error::ImageCapture(_)), 1),
        ];

        for (operation, expected, group_deletions) in cases {
            let gateway = FakeGateway::happy().failing(operation);
            let report = CapturePipeline::new(&gateway, context(None)).run().await;

            let err = report.result.unwrap_err();
            assert!(expected(&err), "{operation} failed with {err:?}");
            assert_eq!(
                gateway.calls_to("delete_resource_group").len(),
                group_deletions,
                "{operation}"
            );
            assert_eq!(gateway.calls_to("delete_snapshot").len(), 1, "{operation}");
            assert_eq!(report.state, PipelineState::CleanedUp, "{operation}");
        }
    }
}
