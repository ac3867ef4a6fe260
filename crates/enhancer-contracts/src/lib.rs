use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

pub const CONTRACT_VERSION: &str = "1.0.0";

/// One embedded envelope schema. `title` and `id` are lifted from the schema
/// body at build time.
#[derive(Debug, Clone, Copy)]
pub struct ContractSchemaManifest {
    pub name: &'static str,
    pub title: &'static str,
    pub id: &'static str,
    pub sha256: &'static str,
    pub body: &'static str,
}

#[derive(Debug, Clone)]
pub struct ContractsManifest {
    pub contracts_dir: &'static str,
    pub contracts_set_sha256: &'static str,
    pub generated_at: &'static str,
    pub schemas: &'static [ContractSchemaManifest],
}

impl ContractsManifest {
    pub fn schema(&self, name: &str) -> Option<&'static ContractSchemaManifest> {
        self.schemas.iter().find(|s| s.name == name)
    }
}

include!(concat!(env!("OUT_DIR"), "/generated_contracts.rs"));

pub fn contracts_manifest_v1() -> ContractsManifest {
    ContractsManifest {
        contracts_dir: GENERATED_CONTRACTS_DIR,
        contracts_set_sha256: GENERATED_CONTRACTS_SET_SHA256,
        generated_at: GENERATED_AT_RFC3339,
        schemas: GENERATED_CONTRACT_SCHEMAS,
    }
}

/// Identifier of the channel whose label is resolved. The cache's only index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ChannelId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayMode {
    Name,
    Handle,
    #[default]
    Both,
}

impl DisplayMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DisplayMode::Name => "name",
            DisplayMode::Handle => "handle",
            DisplayMode::Both => "both",
        }
    }
}

impl fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One-shot request sent across the privilege boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayRequest {
    Resolve { key: ChannelId },
}

impl RelayRequest {
    pub fn key(&self) -> &ChannelId {
        match self {
            RelayRequest::Resolve { key } => key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl RelayResponse {
    pub fn found(label: impl Into<String>) -> Self {
        Self {
            success: true,
            label: Some(label.into()),
        }
    }

    pub fn absent() -> Self {
        Self {
            success: false,
            label: None,
        }
    }

    pub fn from_lookup(label: Option<String>) -> Self {
        match label {
            Some(label) => Self::found(label),
            None => Self::absent(),
        }
    }

    /// `None` unless the response is a success carrying a label.
    pub fn into_label(self) -> Option<String> {
        if self.success {
            self.label
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.as_simple())
    }
}

/// A relay request tagged with the correlation id used to multiplex many
/// outstanding requests over one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeRequest {
    pub request_id: RequestId,
    #[serde(flatten)]
    pub request: RelayRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NotFound,
    Transport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BridgeResponse {
    pub request_id: RequestId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
}

impl BridgeResponse {
    pub fn from_relay(request_id: RequestId, response: RelayResponse) -> Self {
        match response.into_label() {
            Some(label) => Self {
                request_id,
                success: true,
                label: Some(label),
                failure: None,
            },
            None => Self {
                request_id,
                success: false,
                label: None,
                failure: Some(FailureKind::NotFound),
            },
        }
    }

    pub fn transport_failure(request_id: RequestId) -> Self {
        Self {
            request_id,
            success: false,
            label: None,
            failure: Some(FailureKind::Transport),
        }
    }
}

/// Signals pushed by the settings and nickname surfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlSignal {
    DisplayModeChanged { mode: DisplayMode },
    OverridesChanged,
    ClearCache,
}

/// Entry of the durable label cache document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredLabel {
    pub label: String,
    pub observed_at: String,
}

pub type LabelDocument = BTreeMap<ChannelId, StoredLabel>;
pub type OverrideDocument = BTreeMap<ChannelId, String>;
