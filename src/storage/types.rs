//! Storage types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata about a storage object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub key: String,
    pub size: i64,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
}

/// A storage object with its data
#[derive(Debug)]
pub struct StorageObject {
    pub metadata: ObjectMetadata,
    pub data: Vec<u8>,
}
