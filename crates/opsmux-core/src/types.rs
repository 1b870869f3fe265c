//! Common types shared by the proxy, its transports and its front-end.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// Connection status of a supervised provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Starting,
    Connected,
    Disconnected,
    Error,
    AuthFailed,
}

impl ProviderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderStatus::Starting => "starting",
            ProviderStatus::Connected => "connected",
            ProviderStatus::Disconnected => "disconnected",
            ProviderStatus::Error => "error",
            ProviderStatus::AuthFailed => "auth_failed",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ProviderStatus::Connected)
    }
}

impl fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tool exposed by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
}

/// Resource exposed by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescriptor {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Prompt exposed by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<PromptArgument>,
}

/// Argument accepted by a prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object" })
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            input_schema: empty_object_schema(),
        }
    }

    /// Reject descriptors that cannot be routed.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidData("tool descriptor without a name".into()));
        }
        if !self.input_schema.is_object() {
            return Err(Error::InvalidData(format!(
                "tool '{}' has a non-object input schema",
                self.name
            )));
        }
        Ok(())
    }
}

impl ResourceDescriptor {
    pub fn new(uri: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            name: Some(name.into()),
            description: None,
            mime_type: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.uri.trim().is_empty() {
            return Err(Error::InvalidData("resource descriptor without a uri".into()));
        }
        Ok(())
    }
}

impl PromptDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            arguments: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidData("prompt descriptor without a name".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&ProviderStatus::AuthFailed).unwrap();
        assert_eq!(json, "\"auth_failed\"");
        assert_eq!(ProviderStatus::Connected.to_string(), "connected");
    }

    #[test]
    fn test_tool_descriptor_defaults() {
        let tool: ToolDescriptor =
            serde_json::from_value(serde_json::json!({ "name": "list_issues" })).unwrap();
        assert_eq!(tool.input_schema["type"], "object");
        assert!(tool.validate().is_ok());
    }

    #[test]
    fn test_tool_descriptor_camel_case() {
        let tool: ToolDescriptor = serde_json::from_value(serde_json::json!({
            "name": "create_issue",
            "description": "Create an issue",
            "inputSchema": { "type": "object", "required": ["title"] }
        }))
        .unwrap();
        assert_eq!(tool.input_schema["required"][0], "title");
        let json = serde_json::to_value(&tool).unwrap();
        assert!(json.get("inputSchema").is_some());
    }

    #[test]
    fn test_invalid_descriptors() {
        let tool = ToolDescriptor {
            name: "  ".to_string(),
            description: None,
            input_schema: empty_object_schema(),
        };
        assert!(tool.validate().is_err());

        let tool = ToolDescriptor {
            name: "x".to_string(),
            description: None,
            input_schema: serde_json::json!("string"),
        };
        assert!(tool.validate().is_err());

        let resource = ResourceDescriptor {
            uri: String::new(),
            name: None,
            description: None,
            mime_type: None,
        };
        assert!(resource.validate().is_err());
    }
}
