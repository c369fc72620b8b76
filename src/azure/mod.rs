//! [`CloudGateway`] on top of the Azure Resource Manager REST API.
use async_trait::async_trait;
use crate::gateway::{
    CloudGateway, DiskSpec, Error, HyperVGeneration, ImageDefinition, ImageSpec, ImageVersionSpec,
    NetworkInterfaceSpec, PublicAddressSpec, ScriptExtensionSpec, SecurityGroupSpec, SnapshotSpec,
    SourceVm, VirtualNetwork, VirtualNetworkSpec, VmSpec, VmStatus,
};
use crate::resources::ResourceId;

mod client;
mod compute;
mod gallery;
mod network;

pub use client::ArmClient;
use compute::*;
use gallery::*;
use network::*;

const RESOURCES_API_VERSION: &str = "2021-04-01";

#[async_trait]
impl CloudGateway for ArmClient {
    async fn get_vm(&self, resource_group: &str, name: &str) -> Result<SourceVm, Error> {
        self.source_vm(resource_group, name).await
    }

    async fn get_vm_status(&self, resource_group: &str, name: &str) -> Result<VmStatus, Error> {
        self.vm_status(resource_group, name).await
    }

    async fn get_vm_generation(&self, resource_group: &str, name: &str) -> Result<HyperVGeneration, Error> {
        self.vm_generation(resource_group, name).await
    }

    async fn create_snapshot(&self, spec: &SnapshotSpec<'_>) -> Result<ResourceId, Error> {
        let path = self.provider_path(spec.resource_group, SNAPSHOTS, spec.name);
        self.put(&path, DISK_API_VERSION, &snapshot_body(spec)).await
    }

    async fn delete_snapshot(&self, resource_group: &str, name: &str) -> Result<(), Error> {
        let path = self.provider_path(resource_group, SNAPSHOTS, name);
        self.delete(&path, DISK_API_VERSION).await
    }

    async fn create_resource_group(&self, name: &str, location: &str) -> Result<ResourceId, Error> {
        let path = self.resource_group_path(name);
        let body = serde_json::json!({ "location": location });
        self.put(&path, RESOURCES_API_VERSION, &body).await
    }

    async fn delete_resource_group(&self, name: &str) -> Result<(), Error> {
        let path = self.resource_group_path(name);
        self.delete(&path, RESOURCES_API_VERSION).await
    }

    async fn create_disk_from_snapshot(&self, spec: &DiskSpec<'_>) -> Result<ResourceId, Error> {
        let path = self.provider_path(spec.resource_group, DISKS, spec.name);
        self.put(&path, DISK_API_VERSION, &disk_body(spec)).await
    }

    async fn create_virtual_network(&self, spec: &VirtualNetworkSpec<'_>) -> Result<VirtualNetwork, Error> {
        let path = self.provider_path(spec.resource_group, VIRTUAL_NETWORKS, spec.name);
        let id = self.put(&path, NETWORK_API_VERSION, &virtual_network_body(spec)).await?;
        Ok(VirtualNetwork {
            subnet: ResourceId::new(format!("{id}/subnets/{}", spec.subnet_name)),
            id,
        })
    }

    async fn create_security_group(&self, spec: &SecurityGroupSpec<'_>) -> Result<ResourceId, Error> {
        let path = self.provider_path(spec.resource_group, SECURITY_GROUPS, spec.name);
        self.put(&path, NETWORK_API_VERSION, &security_group_body(spec)).await
    }

    async fn create_public_address(&self, spec: &PublicAddressSpec<'_>) -> Result<ResourceId, Error> {
        let path = self.provider_path(spec.resource_group, PUBLIC_ADDRESSES, spec.name);
        self.put(&path, NETWORK_API_VERSION, &public_address_body(spec)).await
    }

    async fn create_network_interface(&self, spec: &NetworkInterfaceSpec<'_>) -> Result<ResourceId, Error> {
        let path = self.provider_path(spec.resource_group, NETWORK_INTERFACES, spec.name);
        self.put(&path, NETWORK_API_VERSION, &network_interface_body(spec)).await
    }

    async fn create_vm(&self, spec: &VmSpec<'_>) -> Result<ResourceId, Error> {
        let path = self.provider_path(spec.resource_group, VIRTUAL_MACHINES, spec.name);
        self.put(&path, COMPUTE_API_VERSION, &vm_body(spec)).await
    }

    async fn run_script_extension(&self, spec: &ScriptExtensionSpec<'_>) -> Result<(), Error> {
        let path = format!(
            "{}/extensions/{}",
            self.provider_path(spec.resource_group, VIRTUAL_MACHINES, spec.vm_name),
            spec.name
        );
        // The script shuts the guest down, so the extension never reports completion.
        self.put_no_wait(&path, COMPUTE_API_VERSION, &script_extension_body(spec)).await
    }

    async fn deallocate_vm(&self, resource_group: &str, name: &str) -> Result<(), Error> {
        self.vm_action(resource_group, name, "deallocate").await
    }

    async fn generalize_vm(&self, resource_group: &str, name: &str) -> Result<(), Error> {
        self.vm_action(resource_group, name, "generalize").await
    }

    async fn create_image(&self, spec: &ImageSpec<'_>) -> Result<ResourceId, Error> {
        let path = self.provider_path(spec.resource_group, IMAGES, spec.name);
        self.put(&path, COMPUTE_API_VERSION, &image_body(spec)).await
    }

    async fn get_image_definition(
        &self,
        resource_group: &str,
        gallery: &str,
        definition: &str,
    ) -> Result<ImageDefinition, Error> {
        let path = self.provider_path(
            resource_group,
            GALLERIES,
            &image_definition_name(gallery, definition),
        );
        let definition: ImageDefinitionResource = self.get(&path, GALLERY_API_VERSION).await?;
        Ok(ImageDefinition {
            id: ResourceId::new(path),
            location: definition.location,
        })
    }

    async fn create_image_version(&self, spec: &ImageVersionSpec<'_>) -> Result<ResourceId, Error> {
        let path = self.provider_path(
            spec.resource_group,
            GALLERIES,
            &image_version_name(spec.gallery, spec.definition, spec.version),
        );
        self.put(&path, GALLERY_API_VERSION, &image_version_body(spec)).await
    }
}
