//! Cloud synchronization: backoff, capability gating, resumable transfer and
//! the coordinator that ties them to the API client.

pub mod backoff;
pub mod capability;
mod coordinator;
pub mod transfer;

pub use backoff::{BackoffPolicy, SyncDomain, SyncState};
pub use capability::{Capability, CapabilityRecord};
pub use coordinator::{
    DomainStatus, FullSyncReport, PageLoadReport, SkipReason, StepResult, SyncCoordinator,
    SyncOutcome, SyncStatus,
};
pub use transfer::{ResumeReason, TransferState};
