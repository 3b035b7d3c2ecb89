//! Wire message types, replication job schema, signed envelopes, and the
//! atomic-file-write primitive shared by the blob store, orchestrator, and
//! worker.

pub mod atomic;
pub mod envelope;
pub mod job;
pub mod messages;
pub mod metadata;
pub mod sink;

pub use atomic::write_atomic;
pub use envelope::{encode_envelope, verify_envelope, EnvelopeError, SignedEnvelope};
pub use job::{JobStatus, ReplicationJob};
pub use messages::{Assignment, AssignmentResult, DelegationMessage, ResourceOffer, ResourceRequest};
pub use metadata::MetadataRecord;
pub use sink::{JobSink, NoOpJobSink};
