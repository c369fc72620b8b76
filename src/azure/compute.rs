//! Microsoft.Compute: virtual machines, disks, snapshots, images.
use serde::Deserialize;
use serde_json::{json, Value};
use crate::gateway::{
    DiskSpec, Error, HyperVGeneration, ImageSpec, OsType, ScriptExtensionSpec, ScriptPayload,
    SnapshotSpec, SourceVm, VmSpec, VmStatus,
};
use crate::resources::ResourceId;
use super::ArmClient;

pub const VIRTUAL_MACHINES: &str = "Microsoft.Compute/virtualMachines";
pub const DISKS: &str = "Microsoft.Compute/disks";
pub const SNAPSHOTS: &str = "Microsoft.Compute/snapshots";
pub const IMAGES: &str = "Microsoft.Compute/images";

pub const COMPUTE_API_VERSION: &str = "2024-07-01";
pub const DISK_API_VERSION: &str = "2023-10-02";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VirtualMachine {
    id: String,
    location: String,
    properties: VmProperties,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VmProperties {
    hardware_profile: HardwareProfile,
    storage_profile: StorageProfile,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HardwareProfile {
    vm_size: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StorageProfile {
    os_disk: OsDisk,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OsDisk {
    os_type: Option<String>,
    managed_disk: Option<ManagedDisk>,
}

#[derive(Deserialize)]
struct ManagedDisk {
    id: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct InstanceView {
    #[serde(default)]
    statuses: Vec<InstanceViewStatus>,
    #[serde(rename = "hyperVGeneration")]
    hyper_v_generation: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceViewStatus {
    code: String,
    display_status: Option<String>,
}

impl VirtualMachine {
    fn into_source_vm(self, url: &str) -> Result<SourceVm, Error> {
        let unexpected = |message: &str| Error::UnexpectedResponse {
            url: url.to_string(),
            message: message.to_string(),
        };
        let os_disk = self.properties.storage_profile.os_disk;
        let disk = os_disk
            .managed_disk
            .ok_or_else(|| unexpected("virtual machine has no managed OS disk"))?;
        let os_type = os_disk
            .os_type
            .ok_or_else(|| unexpected("OS disk has no OS type"))?
            .parse::<OsType>()
            .map_err(|err| unexpected(err.as_str()))?;

        Ok(SourceVm {
            id: ResourceId::new(self.id),
            location: self.location,
            size: self.properties.hardware_profile.vm_size,
            os_type,
            os_disk: ResourceId::new(disk.id),
        })
    }
}

impl InstanceView {
    fn display_status(&self, prefix: &str) -> Option<String> {
        self.statuses
            .iter()
            .find(|status| status.code.starts_with(prefix))
            .and_then(|status| status.display_status.clone())
    }

    fn status(&self) -> VmStatus {
        VmStatus {
            power: self.display_status("PowerState/"),
            provisioning: self.display_status("ProvisioningState/"),
        }
    }

    fn generation(&self) -> HyperVGeneration {
        match self.hyper_v_generation.as_deref() {
            Some("V2") => HyperVGeneration::V2,
            _ => HyperVGeneration::V1,
        }
    }
}

impl ArmClient {
    pub(super) async fn source_vm(&self, resource_group: &str, name: &str) -> Result<SourceVm, Error> {
        let path = self.provider_path(resource_group, VIRTUAL_MACHINES, name);
        let vm: VirtualMachine = self.get(&path, COMPUTE_API_VERSION).await?;
        vm.into_source_vm(&path)
    }

    async fn instance_view(&self, resource_group: &str, name: &str) -> Result<InstanceView, Error> {
        let path = format!(
            "{}/instanceView",
            self.provider_path(resource_group, VIRTUAL_MACHINES, name)
        );
        self.get(&path, COMPUTE_API_VERSION).await
    }

    pub(super) async fn vm_status(&self, resource_group: &str, name: &str) -> Result<VmStatus, Error> {
        Ok(self.instance_view(resource_group, name).await?.status())
    }

    pub(super) async fn vm_generation(&self, resource_group: &str, name: &str) -> Result<HyperVGeneration, Error> {
        Ok(self.instance_view(resource_group, name).await?.generation())
    }

    pub(super) async fn vm_action(&self, resource_group: &str, name: &str, action: &str) -> Result<(), Error> {
        let path = format!(
            "{}/{action}",
            self.provider_path(resource_group, VIRTUAL_MACHINES, name)
        );
        self.post(&path, COMPUTE_API_VERSION).await
    }
}

pub fn snapshot_body(spec: &SnapshotSpec) -> Value {
    json!({
        "location": spec.location,
        "sku": { "name": "Standard_LRS" },
        "properties": {
            "incremental": false,
            "creationData": {
                "createOption": "Copy",
                "sourceResourceId": spec.source_disk.as_str(),
            },
        },
    })
}

pub fn disk_body(spec: &DiskSpec) -> Value {
    json!({
        "location": spec.location,
        "sku": { "name": "StandardSSD_LRS" },
        "properties": {
            "osType": spec.os_type.as_str(),
            "creationData": {
                "createOption": "Copy",
                "sourceResourceId": spec.snapshot.as_str(),
            },
        },
    })
}

pub fn vm_body(spec: &VmSpec) -> Value {
    json!({
        "location": spec.location,
        "properties": {
            "hardwareProfile": { "vmSize": spec.size },
            "storageProfile": {
                "osDisk": {
                    "osType": spec.os_type.as_str(),
                    "createOption": "Attach",
                    "managedDisk": { "id": spec.os_disk.as_str() },
                },
            },
            "networkProfile": {
                "networkInterfaces": [
                    { "id": spec.network_interface.as_str(), "properties": { "primary": true } },
                ],
            },
            "diagnosticsProfile": {
                "bootDiagnostics": { "enabled": false },
            },
        },
    })
}

pub fn script_extension_body(spec: &ScriptExtensionSpec) -> Value {
    let (publisher, typ, version) = match spec.os_type {
        OsType::Windows => ("Microsoft.Compute", "CustomScriptExtension", "1.10"),
        OsType::Linux => ("Microsoft.Azure.Extensions", "CustomScript", "2.1"),
    };
    // Inline payloads carry no fileUris, so the guest fetches nothing.
    let (settings, protected_settings) = match spec.payload {
        ScriptPayload::Download { file_uri, command } => (
            json!({ "fileUris": [file_uri] }),
            json!({ "commandToExecute": command }),
        ),
        ScriptPayload::Command(command) => (json!({}), json!({ "commandToExecute": command })),
        ScriptPayload::Script(script) => (json!({}), json!({ "script": script })),
    };
    json!({
        "location": spec.location,
        "properties": {
            "publisher": publisher,
            "type": typ,
            "typeHandlerVersion": version,
            "autoUpgradeMinorVersion": true,
            "settings": settings,
            "protectedSettings": protected_settings,
        },
    })
}

pub fn image_body(spec: &ImageSpec) -> Value {
    json!({
        "location": spec.location,
        "properties": {
            "sourceVirtualMachine": { "id": spec.source_vm.as_str() },
            "hyperVGeneration": spec.generation.as_str(),
        },
    })
}
