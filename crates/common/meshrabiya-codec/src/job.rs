use crate::messages::{Assignment, AssignmentResult, ResourceOffer};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a `ReplicationJob`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Delegated,
    NoOffers,
    Complete,
    Abandoned,
}

fn default_target_replicas() -> u32 {
    3
}
fn default_max_acceptances() -> u32 {
    5
}
fn default_max_hops() -> u32 {
    3
}

/// Persistent, atomically-rewritten state of one blob's replication attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationJob {
    pub id: Uuid,
    pub blob_path: String,
    pub meta_path: String,
    pub created_at: DateTime<Utc>,
    #[serde(default = "default_target_replicas")]
    pub target_replicas: u32,
    #[serde(default = "default_max_acceptances")]
    pub max_acceptances: u32,
    #[serde(default = "default_max_hops")]
    pub max_hops: u32,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub accepted: u32,
    pub status: JobStatus,
    pub origin_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub offers: Vec<ResourceOffer>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assignments: Vec<Assignment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assignment_results: Vec<AssignmentResult>,
}

impl ReplicationJob {
    pub fn new(
        id: Uuid,
        blob_path: String,
        meta_path: String,
        origin_id: String,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            blob_path,
            meta_path,
            created_at,
            target_replicas: default_target_replicas(),
            max_acceptances: default_max_acceptances(),
            max_hops: default_max_hops(),
            attempts: 0,
            accepted: 0,
            status: JobStatus::Pending,
            origin_id,
            offers: Vec::new(),
            assignments: Vec::new(),
            assignment_results: Vec::new(),
        }
    }

    /// Merge freshly received offers in, superseding any earlier offer from
    /// the same offerer within this job.
    pub fn merge_offers(&mut self, fresh: Vec<ResourceOffer>) {
        for offer in fresh {
            if let Some(existing) = self
                .offers
                .iter_mut()
                .find(|o| o.offerer_id == offer.offerer_id)
            {
                *existing = offer;
            } else {
                self.offers.push(offer);
            }
        }
    }

    /// Recompute `accepted` from `assignment_results`.
    pub fn recompute_accepted(&mut self) {
        self.accepted = self
            .assignment_results
            .iter()
            .filter(|r| r.success)
            .count() as u32;
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, JobStatus::Complete | JobStatus::Abandoned)
    }

    pub fn is_complete(&self) -> bool {
        self.accepted >= self.target_replicas
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(id: &str, space: u64, bw: u64) -> ResourceOffer {
        ResourceOffer {
            request_id: Uuid::nil(),
            offerer_id: id.into(),
            available_space: space,
            estimated_bandwidth: bw,
        }
    }

    #[test]
    fn merge_offers_supersedes_same_offerer() {
        let mut job = ReplicationJob::new(
            Uuid::new_v4(),
            "b.blob".into(),
            "b.meta".into(),
            "origin".into(),
            Utc::now(),
        );
        job.merge_offers(vec![offer("peer1", 100, 10)]);
        job.merge_offers(vec![offer("peer1", 200, 20), offer("peer2", 50, 5)]);
        assert_eq!(job.offers.len(), 2);
        let peer1 = job.offers.iter().find(|o| o.offerer_id == "peer1").unwrap();
        assert_eq!(peer1.available_space, 200);
    }

    #[test]
    fn recompute_accepted_counts_only_successes() {
        let mut job = ReplicationJob::new(
            Uuid::new_v4(),
            "b.blob".into(),
            "b.meta".into(),
            "origin".into(),
            Utc::now(),
        );
        job.assignment_results.push(AssignmentResult {
            request_id: Uuid::nil(),
            assignee_id: "peer1".into(),
            blob_id: job.id,
            success: true,
            message: None,
        });
        job.assignment_results.push(AssignmentResult {
            request_id: Uuid::nil(),
            assignee_id: "peer2".into(),
            blob_id: job.id,
            success: false,
            message: Some("failed".into()),
        });
        job.recompute_accepted();
        assert_eq!(job.accepted, 1);
    }

    #[test]
    fn job_json_round_trips_with_defaults() {
        let job = ReplicationJob::new(
            Uuid::new_v4(),
            "b.blob".into(),
            "b.meta".into(),
            "origin".into(),
            Utc::now(),
        );
        let json = serde_json::to_string(&job).unwrap();
        let decoded: ReplicationJob = serde_json::from_str(&json).unwrap();
        assert_eq!(job.id, decoded.id);
        assert_eq!(decoded.target_replicas, 3);
        assert_eq!(decoded.status, JobStatus::Pending);
    }
}
