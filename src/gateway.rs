//! The only interface between the capture pipeline and the cloud provider.
//!
//! Every operation is one request/response from the caller's point of view:
//! implementations wait for any long-running operation to finish before
//! returning. A non-success answer is always an error.
use async_trait::async_trait;
use thiserror::Error;
use crate::resources::ResourceId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{method} {url} failed with status {status}: {body}")]
    Api {
        method: String,
        url: String,
        status: u16,
        body: String,
    },

    #[error("operation on {resource} ended with status {status}: {message}")]
    OperationFailed {
        resource: String,
        status: String,
        message: String,
    },

    #[error("operation on {0} did not finish in time")]
    OperationTimedOut(String),

    #[error("unexpected response from {url}: {message}")]
    UnexpectedResponse { url: String, message: String },

    #[error("reqwest: {0}")]
    Reqwest(#[from] reqwest::Error),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsType {
    Windows,
    Linux,
}

impl OsType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OsType::Windows => "Windows",
            OsType::Linux => "Linux",
        }
    }

    /// RDP for Windows, SSH for Linux.
    pub fn remote_admin_port(&self) -> u16 {
        match self {
            OsType::Windows => 3389,
            OsType::Linux => 22,
        }
    }
}

impl std::str::FromStr for OsType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "windows" => Ok(OsType::Windows),
            "linux" => Ok(OsType::Linux),
            other => Err(format!("unknown OS type {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HyperVGeneration {
    V1,
    V2,
}

impl HyperVGeneration {
    pub fn as_str(&self) -> &'static str {
        match self {
            HyperVGeneration::V1 => "V1",
            HyperVGeneration::V2 => "V2",
        }
    }
}

/// What the pipeline needs to know about the machine being captured.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceVm {
    pub id: ResourceId,
    pub location: String,
    pub size: String,
    pub os_type: OsType,
    pub os_disk: ResourceId,
}

pub const DISPLAY_STATUS_RUNNING: &str = "VM running";
pub const DISPLAY_STATUS_STOPPED: &str = "VM stopped";

/// Power and provisioning state as displayed by the platform.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VmStatus {
    pub power: Option<String>,
    pub provisioning: Option<String>,
}

impl VmStatus {
    pub fn is_running(&self) -> bool {
        self.power.as_deref() == Some(DISPLAY_STATUS_RUNNING)
    }

    /// Stopped by the guest, still allocated. Generalization shuts the guest
    /// down, which is reported this way.
    pub fn is_stopped(&self) -> bool {
        self.power.as_deref() == Some(DISPLAY_STATUS_STOPPED)
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotSpec<'a> {
    pub resource_group: &'a str,
    pub name: &'a str,
    pub location: &'a str,
    pub source_disk: &'a ResourceId,
}

#[derive(Debug, Clone)]
pub struct DiskSpec<'a> {
    pub resource_group: &'a str,
    pub name: &'a str,
    pub location: &'a str,
    pub os_type: OsType,
    pub snapshot: &'a ResourceId,
}

#[derive(Debug, Clone)]
pub struct VirtualNetworkSpec<'a> {
    pub resource_group: &'a str,
    pub name: &'a str,
    pub location: &'a str,
    pub address_prefix: &'a str,
    pub subnet_name: &'a str,
    pub subnet_prefix: &'a str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VirtualNetwork {
    pub id: ResourceId,
    pub subnet: ResourceId,
}

/// A security group with a single inbound allow rule for the remote
/// administration port, from any source.
#[derive(Debug, Clone)]
pub struct SecurityGroupSpec<'a> {
    pub resource_group: &'a str,
    pub name: &'a str,
    pub location: &'a str,
    pub remote_admin_port: u16,
}

#[derive(Debug, Clone)]
pub struct PublicAddressSpec<'a> {
    pub resource_group: &'a str,
    pub name: &'a str,
    pub location: &'a str,
}

#[derive(Debug, Clone)]
pub struct NetworkInterfaceSpec<'a> {
    pub resource_group: &'a str,
    pub name: &'a str,
    pub location: &'a str,
    pub subnet: &'a ResourceId,
    pub public_address: &'a ResourceId,
    pub security_group: &'a ResourceId,
}

/// A VM booting from an attached OS disk, with boot diagnostics disabled.
#[derive(Debug, Clone)]
pub struct VmSpec<'a> {
    pub resource_group: &'a str,
    pub name: &'a str,
    pub location: &'a str,
    pub size: &'a str,
    pub os_type: OsType,
    pub os_disk: &'a ResourceId,
    pub network_interface: &'a ResourceId,
}

#[derive(Debug, Clone)]
pub struct ScriptExtensionSpec<'a> {
    pub resource_group: &'a str,
    pub vm_name: &'a str,
    pub location: &'a str,
    pub os_type: OsType,
    pub name: &'a str,
    pub payload: &'a ScriptPayload,
}

/// How the script extension gets the script it runs.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptPayload {
    /// The guest downloads `file_uri` and runs `command` on it.
    Download { file_uri: String, command: String },
    /// A command line carrying the whole script. Nothing is downloaded.
    Command(String),
    /// A base64 encoded script for the Linux extension. Nothing is downloaded.
    Script(String),
}

#[derive(Debug, Clone)]
pub struct ImageSpec<'a> {
    pub resource_group: &'a str,
    pub name: &'a str,
    pub location: &'a str,
    pub source_vm: &'a ResourceId,
    pub generation: HyperVGeneration,
}

#[derive(Debug, Clone)]
pub struct ImageVersionSpec<'a> {
    pub resource_group: &'a str,
    pub gallery: &'a str,
    pub definition: &'a str,
    pub version: &'a str,
    /// The gallery's location. ARM rejects a version placed anywhere else.
    pub location: &'a str,
    /// Where the source image lives; replicated there as well.
    pub source_region: &'a str,
    pub source_image: &'a ResourceId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageDefinition {
    pub id: ResourceId,
    pub location: String,
}

#[async_trait]
pub trait CloudGateway: Send + Sync {
    async fn get_vm(&self, resource_group: &str, name: &str) -> Result<SourceVm, Error>;

    async fn get_vm_status(&self, resource_group: &str, name: &str) -> Result<VmStatus, Error>;

    async fn get_vm_generation(&self, resource_group: &str, name: &str) -> Result<HyperVGeneration, Error>;

    async fn create_snapshot(&self, spec: &SnapshotSpec<'_>) -> Result<ResourceId, Error>;

    async fn delete_snapshot(&self, resource_group: &str, name: &str) -> Result<(), Error>;

    async fn create_resource_group(&self, name: &str, location: &str) -> Result<ResourceId, Error>;

    /// Deletes the group and everything in it.
    async fn delete_resource_group(&self, name: &str) -> Result<(), Error>;

    async fn create_disk_from_snapshot(&self, spec: &DiskSpec<'_>) -> Result<ResourceId, Error>;

    async fn create_virtual_network(&self, spec: &VirtualNetworkSpec<'_>) -> Result<VirtualNetwork, Error>;

    async fn create_security_group(&self, spec: &SecurityGroupSpec<'_>) -> Result<ResourceId, Error>;

    async fn create_public_address(&self, spec: &PublicAddressSpec<'_>) -> Result<ResourceId, Error>;

    async fn create_network_interface(&self, spec: &NetworkInterfaceSpec<'_>) -> Result<ResourceId, Error>;

    /// Creates the VM and starts it.
    async fn create_vm(&self, spec: &VmSpec<'_>) -> Result<ResourceId, Error>;

    /// Issues the extension without waiting for the script to finish.
    async fn run_script_extension(&self, spec: &ScriptExtensionSpec<'_>) -> Result<(), Error>;

    async fn deallocate_vm(&self, resource_group: &str, name: &str) -> Result<(), Error>;

    async fn generalize_vm(&self, resource_group: &str, name: &str) -> Result<(), Error>;

    async fn create_image(&self, spec: &ImageSpec<'_>) -> Result<ResourceId, Error>;

    async fn get_image_definition(
        &self,
        resource_group: &str,
        gallery: &str,
        definition: &str,
    ) -> Result<ImageDefinition, Error>;

    async fn create_image_version(&self, spec: &ImageVersionSpec<'_>) -> Result<ResourceId, Error>;
}
