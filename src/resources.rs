use std::fmt::{Display, Formatter};

/// Fully qualified ARM resource id, e.g.
/// `/subscriptions/<sub>/resourceGroups/<rg>/providers/Microsoft.Compute/snapshots/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last path segment of the id, which is the resource name.
    pub fn name(&self) -> &str {
        self.0.trim_end_matches('/').rsplit('/').next().unwrap_or_default()
    }

    /// Name of the resource group that contains this resource.
    /// For a resource group id, this is the group itself.
    pub fn resource_group(&self) -> Option<&str> {
        let mut segments = self.0.split('/');
        while let Some(segment) = segments.next() {
            if segment.eq_ignore_ascii_case("resourcegroups") {
                return segments.next().filter(|name| !name.is_empty());
            }
        }
        None
    }
}

impl Display for ResourceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Every kind of resource a capture run creates, in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Snapshot,
    ResourceGroup,
    Disk,
    VirtualNetwork,
    SecurityGroup,
    PublicAddress,
    NetworkInterface,
    VirtualMachine,
    Image,
    ImageVersion,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 10] = [
        ResourceKind::Snapshot,
        ResourceKind::ResourceGroup,
        ResourceKind::Disk,
        ResourceKind::VirtualNetwork,
        ResourceKind::SecurityGroup,
        ResourceKind::PublicAddress,
        ResourceKind::NetworkInterface,
        ResourceKind::VirtualMachine,
        ResourceKind::Image,
        ResourceKind::ImageVersion,
    ];
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ResourceKind::Snapshot => "snapshot",
            ResourceKind::ResourceGroup => "resource group",
            ResourceKind::Disk => "disk",
            ResourceKind::VirtualNetwork => "virtual network",
            ResourceKind::SecurityGroup => "network security group",
            ResourceKind::PublicAddress => "public IP address",
            ResourceKind::NetworkInterface => "network interface",
            ResourceKind::VirtualMachine => "virtual machine",
            ResourceKind::Image => "image",
            ResourceKind::ImageVersion => "image version",
        })
    }
}

/// Handles to everything created during one capture run.
///
/// Slots are filled in creation order, each exactly once, right after the
/// corresponding create call succeeds. After an early failure any suffix of
/// slots is empty; cleanup only looks at slots that are set.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CaptureResources {
    snapshot: Option<ResourceId>,
    resource_group: Option<ResourceId>,
    disk: Option<ResourceId>,
    virtual_network: Option<ResourceId>,
    security_group: Option<ResourceId>,
    public_address: Option<ResourceId>,
    network_interface: Option<ResourceId>,
    virtual_machine: Option<ResourceId>,
    image: Option<ResourceId>,
    image_version: Option<ResourceId>,
}

impl CaptureResources {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, kind: ResourceKind) -> &Option<ResourceId> {
        match kind {
            ResourceKind::Snapshot => &self.snapshot,
            ResourceKind::ResourceGroup => &self.resource_group,
            ResourceKind::Disk => &self.disk,
            ResourceKind::VirtualNetwork => &self.virtual_network,
            ResourceKind::SecurityGroup => &self.security_group,
            ResourceKind::PublicAddress => &self.public_address,
            ResourceKind::NetworkInterface => &self.network_interface,
            ResourceKind::VirtualMachine => &self.virtual_machine,
            ResourceKind::Image => &self.image,
            ResourceKind::ImageVersion => &self.image_version,
        }
    }

    fn slot_mut(&mut self, kind: ResourceKind) -> &mut Option<ResourceId> {
        match kind {
            ResourceKind::Snapshot => &mut self.snapshot,
            ResourceKind::ResourceGroup => &mut self.resource_group,
            ResourceKind::Disk => &mut self.disk,
            ResourceKind::VirtualNetwork => &mut self.virtual_network,
            ResourceKind::SecurityGroup => &mut self.security_group,
            ResourceKind::PublicAddress => &mut self.public_address,
            ResourceKind::NetworkInterface => &mut self.network_interface,
            ResourceKind::VirtualMachine => &mut self.virtual_machine,
            ResourceKind::Image => &mut self.image,
            ResourceKind::ImageVersion => &mut self.image_version,
        }
    }

    /// Record a freshly created resource. A slot is written once per run.
    pub fn record(&mut self, kind: ResourceKind, id: ResourceId) {
        let slot = self.slot_mut(kind);
        debug_assert!(slot.is_none(), "{kind} recorded twice");
        *slot = Some(id);
    }

    pub fn get(&self, kind: ResourceKind) -> Option<&ResourceId> {
        self.slot(kind).as_ref()
    }

    pub fn snapshot(&self) -> Option<&ResourceId> {
        self.snapshot.as_ref()
    }

    pub fn resource_group(&self) -> Option<&ResourceId> {
        self.resource_group.as_ref()
    }

    pub fn image(&self) -> Option<&ResourceId> {
        self.image.as_ref()
    }

    /// All recorded resources, in creation order.
    pub fn created(&self) -> impl Iterator<Item = (ResourceKind, &ResourceId)> + '_ {
        ResourceKind::ALL
            .into_iter()
            .filter_map(|kind| self.get(kind).map(|id| (kind, id)))
    }
}
