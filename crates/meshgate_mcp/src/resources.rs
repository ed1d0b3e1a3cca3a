//! MCP resource surface.
//!
//! The router delegates `resources/*` to this port. The gateway ships a
//! small in-memory store carrying reference documents (usage notes, tool
//! conventions); deployments with richer needs inject their own.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Resource listing entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescriptor {
    pub uri: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Resource body returned by `resources/read`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceContent {
    pub uri: String,
    pub mime_type: String,
    pub text: String,
}

/// Template entry for `resources/templates/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTemplate {
    pub uri_template: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Resource persistence port.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn list(&self) -> Vec<ResourceDescriptor>;

    async fn read(&self, uri: &str) -> Option<ResourceContent>;

    async fn templates(&self) -> Vec<ResourceTemplate>;
}

/// Fixed in-memory resource set.
#[derive(Default)]
pub struct MemoryResourceStore {
    entries: Vec<(ResourceDescriptor, String)>,
    templates: Vec<ResourceTemplate>,
}

impl MemoryResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        uri: impl Into<String>,
        name: impl Into<String>,
        mime_type: impl Into<String>,
        text: impl Into<String>,
    ) {
        let uri = uri.into();
        let mime_type = mime_type.into();
        self.entries.push((
            ResourceDescriptor {
                uri: uri.clone(),
                name: name.into(),
                description: None,
                mime_type: Some(mime_type),
            },
            text.into(),
        ));
    }

    pub fn add_template(&mut self, uri_template: impl Into<String>, name: impl Into<String>) {
        self.templates.push(ResourceTemplate {
            uri_template: uri_template.into(),
            name: name.into(),
            description: None,
        });
    }
}

#[async_trait]
impl ResourceStore for MemoryResourceStore {
    async fn list(&self) -> Vec<ResourceDescriptor> {
        self.entries.iter().map(|(d, _)| d.clone()).collect()
    }

    async fn read(&self, uri: &str) -> Option<ResourceContent> {
        self.entries
            .iter()
            .find(|(d, _)| d.uri == uri)
            .map(|(d, text)| ResourceContent {
                uri: d.uri.clone(),
                mime_type: d
                    .mime_type
                    .clone()
                    .unwrap_or_else(|| "text/plain".to_string()),
                text: text.clone(),
            })
    }

    async fn templates(&self) -> Vec<ResourceTemplate> {
        self.templates.clone()
    }
}
