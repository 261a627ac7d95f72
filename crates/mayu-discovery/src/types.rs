//! etcd v2 keys API shapes used by the discovery protocol

use serde::{Deserialize, Serialize};

pub const ERROR_KEY_NOT_FOUND: u32 = 100;
pub const ERROR_NOT_FILE: u32 = 102;
pub const ERROR_NODE_EXIST: u32 = 105;
pub const ERROR_INVALID_FIELD: u32 = 209;
pub const ERROR_EVENT_INDEX_CLEARED: u32 = 401;

/// A key or directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EtcdNode {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<Vec<EtcdNode>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dir: bool,
    #[serde(rename = "modifiedIndex", default, skip_serializing_if = "Option::is_none")]
    pub modified_index: Option<u64>,
    #[serde(rename = "createdIndex", default, skip_serializing_if = "Option::is_none")]
    pub created_index: Option<u64>,
}

impl EtcdNode {
    pub fn key(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
            nodes: None,
            dir: false,
            modified_index: None,
            created_index: None,
        }
    }

    pub fn value(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            ..Self::key(key)
        }
    }

    /// A directory; an empty listing is omitted on the wire
    pub fn dir(key: impl Into<String>, nodes: Vec<EtcdNode>) -> Self {
        Self {
            nodes: if nodes.is_empty() { None } else { Some(nodes) },
            dir: true,
            ..Self::key(key)
        }
    }

    pub fn with_index(mut self, created: u64, modified: u64) -> Self {
        self.created_index = Some(created);
        self.modified_index = Some(modified);
        self
    }
}

/// Envelope of a successful keys API call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EtcdResponse {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<EtcdNode>,
}

impl EtcdResponse {
    pub fn new(action: impl Into<String>, node: EtcdNode) -> Self {
        Self {
            action: action.into(),
            node: Some(node),
        }
    }
}

/// Envelope of a failed keys API call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EtcdError {
    #[serde(rename = "errorCode")]
    pub error_code: u32,
    pub message: String,
    pub cause: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u64>,
}

impl EtcdError {
    pub fn key_not_found(cause: impl Into<String>) -> Self {
        Self {
            error_code: ERROR_KEY_NOT_FOUND,
            message: "Key not found".to_string(),
            cause: cause.into(),
            index: None,
        }
    }

    pub fn node_exists(cause: impl Into<String>) -> Self {
        Self {
            error_code: ERROR_NODE_EXIST,
            message: "Key already exists".to_string(),
            cause: cause.into(),
            index: None,
        }
    }

    pub fn not_file(cause: impl Into<String>) -> Self {
        Self {
            error_code: ERROR_NOT_FILE,
            message: "Not a file".to_string(),
            cause: cause.into(),
            index: None,
        }
    }

    pub fn invalid_field(cause: impl Into<String>) -> Self {
        Self {
            error_code: ERROR_INVALID_FIELD,
            message: "Invalid field".to_string(),
            cause: cause.into(),
            index: None,
        }
    }

    /// `wait_index` is older than the retained history, which starts at `oldest`
    pub fn event_index_cleared(wait_index: u64, oldest: u64, current: u64) -> Self {
        Self {
            error_code: ERROR_EVENT_INDEX_CLEARED,
            message: "The event in requested index is outdated and cleared".to_string(),
            cause: format!("the requested history has been cleared [{}/{}]", oldest, wait_index),
            index: Some(current),
        }
    }

    /// HTTP status etcd answers this error with
    pub fn status(&self) -> u16 {
        match self.error_code {
            ERROR_KEY_NOT_FOUND => 404,
            ERROR_NODE_EXIST => 412,
            ERROR_NOT_FILE => 403,
            _ => 400,
        }
    }
}
