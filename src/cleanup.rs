use log::{info, warn};
use thiserror::Error;
use crate::gateway::{self, CloudGateway};
use crate::resources::{CaptureResources, ResourceId};

#[derive(Error, Debug)]
pub enum Error {
    #[error("delete temporary resource group {name}: {source}")]
    ResourceGroup {
        name: String,
        source: gateway::Error,
    },

    #[error("delete source snapshot {name}: {source}")]
    Snapshot {
        name: String,
        source: gateway::Error,
    },

    #[error("{0} has no resource group in its id")]
    MalformedId(ResourceId),
}

/// Which of the recorded resources to remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupPlan {
    pub delete_resource_group: bool,
    pub delete_snapshot: bool,
}

/// What a cleanup pass did, per resource.
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub deleted: Vec<ResourceId>,
    pub already_absent: Vec<ResourceId>,
    pub retained: Vec<ResourceId>,
    pub errors: Vec<Error>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Removes the temporary resources of a capture run.
///
/// The temporary group is deleted as a whole, which takes the VM, its disk
/// and its network with it. The source snapshot lives in the source group and
/// is deleted on its own. The two deletions are independent: one failing
/// does not stop the other. Failures are reported, never retried.
pub struct CleanupCoordinator<'a, G: CloudGateway + ?Sized> {
    gateway: &'a G,
}

impl<'a, G: CloudGateway + ?Sized> CleanupCoordinator<'a, G> {
    pub fn new(gateway: &'a G) -> Self {
        Self { gateway }
    }

    pub async fn run(&self, resources: &CaptureResources, plan: CleanupPlan) -> CleanupReport {
        let mut report = CleanupReport::default();

        if let Some(group) = resources.resource_group() {
            if plan.delete_resource_group {
                let name = group.name();
                info!("Deleting temporary resource group {name}");
                match self.gateway.delete_resource_group(name).await {
                    Ok(()) => report.deleted.push(group.clone()),
                    Err(err) if err.is_not_found() => {
                        info!("Resource group {name} was already deleted");
                        report.already_absent.push(group.clone());
                    }
                    Err(source) => report.errors.push(Error::ResourceGroup {
                        name: name.to_string(),
                        source,
                    }),
                }
            } else {
                warn!("Keeping temporary resource group {group} for manual recovery");
                report.retained.push(group.clone());
            }
        }

        if let Some(snapshot) = resources.snapshot() {
            if plan.delete_snapshot {
                self.delete_snapshot(snapshot, &mut report).await;
            } else {
                info!("Keeping source snapshot {snapshot}");
                report.retained.push(snapshot.clone());
            }
        }

        for err in &report.errors {
            warn!("Cleanup: {err}");
        }
        report
    }

    async fn delete_snapshot(&self, snapshot: &ResourceId, report: &mut CleanupReport) {
        let Some(resource_group) = snapshot.resource_group() else {
            report.errors.push(Error::MalformedId(snapshot.clone()));
            return;
        };
        let name = snapshot.name();
        info!("Deleting source snapshot {name}");
        match self.gateway.delete_snapshot(resource_group, name).await {
            Ok(()) => report.deleted.push(snapshot.clone()),
            Err(err) if err.is_not_found() => {
                info!("Snapshot {name} was already deleted");
                report.already_absent.push(snapshot.clone());
            }
            Err(source) => report.errors.push(Error::Snapshot {
                name: name.to_string(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::fake::{id, FakeGateway};
    use crate::resources::ResourceKind;

    const EVERYTHING: CleanupPlan = CleanupPlan {
        delete_resource_group: true,
        delete_snapshot: true,
    };

    fn resources(kinds: &[ResourceKind]) -> CaptureResources {
        let mut resources = CaptureResources::new();
        for kind in kinds {
            let resource = match kind {
                ResourceKind::Snapshot => id("rg-prod", "Microsoft.Compute/snapshots", "web01202610191542"),
                ResourceKind::ResourceGroup => ResourceId::new(
                    "/subscriptions/0/resourceGroups/web01202610191542_ImageRG",
                ),
                other => id("web01202610191542_ImageRG", "Some/type", &other.to_string()),
            };
            resources.record(*kind, resource);
        }
        resources
    }

    #[tokio::test]
    async fn nothing_recorded_nothing_deleted() {
        let gateway = FakeGateway::default();
        let report = CleanupCoordinator::new(&gateway).run(&CaptureResources::new(), EVERYTHING).await;
        assert!(report.is_clean());
        assert!(gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn deletes_only_what_was_recorded() {
        for k in 0..=ResourceKind::ALL.len() {
            let gateway = FakeGateway::default();
            let recorded = resources(&ResourceKind::ALL[..k]);
            let report = CleanupCoordinator::new(&gateway).run(&recorded, EVERYTHING).await;

            let expected: Vec<String> = [
                (k >= 2).then(|| "delete_resource_group web01202610191542_ImageRG".to_string()),
                (k >= 1).then(|| "delete_snapshot web01202610191542".to_string()),
            ]
            .into_iter()
            .flatten()
            .collect();
            assert_eq!(gateway.calls(), expected, "first {k} resources recorded");
            assert!(report.is_clean());
        }
    }

    #[tokio::test]
    async fn snapshot_is_kept_when_configured() {
        let gateway = FakeGateway::default();
        let recorded = resources(&ResourceKind::ALL[..3]);
        let report = CleanupCoordinator::new(&gateway)
            .run(&recorded, CleanupPlan { delete_snapshot: false, ..EVERYTHING })
            .await;
        assert_eq!(gateway.operations(), vec!["delete_resource_group"]);
        assert_eq!(report.retained, vec![recorded.snapshot().unwrap().clone()]);
    }

    #[tokio::test]
    async fn group_failure_does_not_prevent_snapshot_deletion() {
        let gateway = FakeGateway::default().failing("delete_resource_group");
        let recorded = resources(&ResourceKind::ALL[..2]);
        let report = CleanupCoordinator::new(&gateway).run(&recorded, EVERYTHING).await;

        assert_eq!(gateway.operations(), vec!["delete_resource_group", "delete_snapshot"]);
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(report.errors[0], Error::ResourceGroup { .. }));
        assert_eq!(report.deleted, vec![recorded.snapshot().unwrap().clone()]);
    }

    #[tokio::test]
    async fn snapshot_failure_is_reported() {
        let gateway = FakeGateway::default().failing("delete_snapshot");
        let recorded = resources(&ResourceKind::ALL[..2]);
        let report = CleanupCoordinator::new(&gateway).run(&recorded, EVERYTHING).await;

        assert_eq!(report.errors.len(), 1);
        assert!(matches!(report.errors[0], Error::Snapshot { .. }));
        assert_eq!(report.deleted.len(), 1);
    }

    #[tokio::test]
    async fn cleaning_up_twice_is_a_no_op() {
        let recorded = resources(&ResourceKind::ALL);
        let gateway = FakeGateway::default()
            .missing("web01202610191542_ImageRG")
            .missing("web01202610191542");
        let report = CleanupCoordinator::new(&gateway).run(&recorded, EVERYTHING).await;

        assert!(report.is_clean());
        assert!(report.deleted.is_empty());
        assert_eq!(report.already_absent.len(), 2);
    }
}
