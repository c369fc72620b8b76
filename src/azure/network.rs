//! Microsoft.Network: the throwaway network the temporary VM lives in.
use serde_json::{json, Value};
use crate::gateway::{NetworkInterfaceSpec, PublicAddressSpec, SecurityGroupSpec, VirtualNetworkSpec};

pub const VIRTUAL_NETWORKS: &str = "Microsoft.Network/virtualNetworks";
pub const SECURITY_GROUPS: &str = "Microsoft.Network/networkSecurityGroups";
pub const PUBLIC_ADDRESSES: &str = "Microsoft.Network/publicIPAddresses";
pub const NETWORK_INTERFACES: &str = "Microsoft.Network/networkInterfaces";

pub const NETWORK_API_VERSION: &str = "2024-05-01";

pub fn virtual_network_body(spec: &VirtualNetworkSpec) -> Value {
    json!({
        "location": spec.location,
        "properties": {
            "addressSpace": { "addressPrefixes": [spec.address_prefix] },
            "subnets": [
                { "name": spec.subnet_name, "properties": { "addressPrefix": spec.subnet_prefix } },
            ],
        },
    })
}

/// Remote administration from anywhere. Convenient for debugging a stuck
/// generalization; not a production posture.
pub fn security_group_body(spec: &SecurityGroupSpec) -> Value {
    json!({
        "location": spec.location,
        "properties": {
            "securityRules": [
                {
                    "name": "AllowRemoteAdmin",
                    "properties": {
                        "protocol": "Tcp",
                        "direction": "Inbound",
                        "access": "Allow",
                        "priority": 1000,
                        "sourceAddressPrefix": "*",
                        "sourcePortRange": "*",
                        "destinationAddressPrefix": "*",
                        "destinationPortRange": spec.remote_admin_port.to_string(),
                    },
                },
            ],
        },
    })
}

pub fn public_address_body(spec: &PublicAddressSpec) -> Value {
    json!({
        "location": spec.location,
        "sku": { "name": "Standard" },
        "properties": { "publicIPAllocationMethod": "Static" },
    })
}

pub fn network_interface_body(spec: &NetworkInterfaceSpec) -> Value {
    json!({
        "location": spec.location,
        "properties": {
            "ipConfigurations": [
                {
                    "name": "ipconfig1",
                    "properties": {
                        "subnet": { "id": spec.subnet.as_str() },
                        "publicIPAddress": { "id": spec.public_address.as_str() },
                    },
                },
            ],
            "networkSecurityGroup": { "id": spec.security_group.as_str() },
        },
    })
}
