use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A request for replication assignees, broadcast by the Delegation
/// Orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub request_id: Uuid,
    pub blob_id: Uuid,
    pub size_bytes: u64,
    pub originator_id: String,
    pub target_replicas: u32,
}

/// A peer's response to a `ResourceRequest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceOffer {
    pub request_id: Uuid,
    pub offerer_id: String,
    pub available_space: u64,
    pub estimated_bandwidth: u64,
}

/// A capability issued to a peer authorising it to accept an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub request_id: Uuid,
    pub assignee_id: String,
    pub blob_id: Uuid,
    pub capability_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_endpoint: Option<String>,
}

/// The outcome of one upload attempt to one assignee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentResult {
    pub request_id: Uuid,
    pub assignee_id: String,
    pub blob_id: Uuid,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Tagged union of every message exchanged over the gossip bus. Serializes
/// to the wire shape:
/// `{"__delegation_type": "Request"|"Offer"|"Assignment"|"Result", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "__delegation_type", content = "payload")]
pub enum DelegationMessage {
    Request(ResourceRequest),
    Offer(ResourceOffer),
    Assignment(Assignment),
    Result(AssignmentResult),
}

impl DelegationMessage {
    pub fn request_id(&self) -> Uuid {
        match self {
            DelegationMessage::Request(m) => m.request_id,
            DelegationMessage::Offer(m) => m.request_id,
            DelegationMessage::Assignment(m) => m.request_id,
            DelegationMessage::Result(m) => m.request_id,
        }
    }
}
