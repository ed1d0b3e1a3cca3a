//! The capabilities envelope advertised by `initialize` and
//! `list_capabilities`.

use serde::{Deserialize, Serialize};

/// Everything a client needs to know about this gateway build.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitiesEnvelope {
    pub plugin_version: String,
    pub tool_schema_version: String,
    pub blockbench_version: String,
    pub limits: Limits,
    pub tool_registry: ToolRegistryInfo,
    pub authoring: AuthoringCapabilities,
    pub formats: Vec<String>,
}

/// Advertised modeling limits. The gateway advertises; backends enforce.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Limits {
    pub max_cubes: u32,
    pub max_texture_size: u32,
    pub max_animation_seconds: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_cubes: 10_000,
            max_texture_size: 4096,
            max_animation_seconds: 300,
        }
    }
}

/// Registry fingerprint; clients caching tool schemas invalidate on hash
/// mismatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolRegistryInfo {
    pub hash: String,
    pub count: usize,
}

/// Authoring surfaces the registered backends support.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthoringCapabilities {
    pub meshes: bool,
    pub animations: bool,
    pub textures: bool,
}

impl Default for AuthoringCapabilities {
    fn default() -> Self {
        Self {
            meshes: true,
            animations: true,
            textures: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_round_trip() {
        let envelope = CapabilitiesEnvelope {
            plugin_version: "0.1.0".to_string(),
            tool_schema_version: "1".to_string(),
            blockbench_version: "4.12".to_string(),
            limits: Limits::default(),
            tool_registry: ToolRegistryInfo {
                hash: "abcd".to_string(),
                count: 11,
            },
            authoring: AuthoringCapabilities::default(),
            formats: vec!["bbmodel".to_string(), "gltf".to_string()],
        };

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["limits"]["maxCubes"], 10_000);
        assert_eq!(json["toolRegistry"]["count"], 11);

        let back: CapabilitiesEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(back.tool_registry.hash, "abcd");
    }
}
