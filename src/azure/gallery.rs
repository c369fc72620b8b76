//! Azure Compute Gallery image definitions and versions.
use serde::Deserialize;
use serde_json::{json, Value};
use crate::gateway::ImageVersionSpec;

pub const GALLERIES: &str = "Microsoft.Compute/galleries";

pub const GALLERY_API_VERSION: &str = "2023-07-03";

pub fn image_definition_name(gallery: &str, definition: &str) -> String {
    format!("{gallery}/images/{definition}")
}

pub fn image_version_name(gallery: &str, definition: &str, version: &str) -> String {
    format!("{gallery}/images/{definition}/versions/{version}")
}

#[derive(Deserialize)]
pub struct ImageDefinitionResource {
    pub location: String,
}

/// A version placed in the gallery's location, with one replica there and
/// one in the source image's region.
pub fn image_version_body(spec: &ImageVersionSpec) -> Value {
    let mut target_regions = vec![json!({ "name": spec.location, "regionalReplicaCount": 1 })];
    if !spec.source_region.eq_ignore_ascii_case(spec.location) {
        target_regions.push(json!({ "name": spec.source_region, "regionalReplicaCount": 1 }));
    }
    json!({
        "location": spec.location,
        "properties": {
            "storageProfile": {
                "source": { "id": spec.source_image.as_str() },
            },
            "publishingProfile": {
                "targetRegions": target_regions,
            },
        },
    })
}
