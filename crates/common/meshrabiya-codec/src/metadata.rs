use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata Record written once alongside a blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub id: Uuid,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub owner_id: String,
    #[serde(default)]
    pub owner_tags: Vec<String>,
}
