//! Tankd Dataset - the pool dataset service
//!
//! This crate provides:
//! - Dataset query, create, update, delete, rename and promote
//! - Encryption: key escrow, change-key, lock, recursive unlock and summaries
//! - Attachment delegates that are stopped and started around mount changes
//! - User, group and dataset quotas
//! - Pool import at boot and the periodic key reconciliation task

pub mod attachments;
pub mod choices;
pub mod collaborators;
pub mod config;
pub mod crud;
pub mod encryption;
pub mod import;
pub mod jobs;
pub mod lock;
pub mod normalize;
pub mod periodic;
pub mod processes;
pub mod query;
pub mod quota;
pub mod service;
pub mod summary;
pub mod validate;

#[cfg(test)]
mod testutil;

// Re-export primary types
pub use config::DatasetConfig;
pub use service::{dataset_mountpoint, DatasetService};

// Re-export request and result types
pub use crud::{DeleteOptions, RenameRequest};
pub use encryption::{ChangeKeyRequest, EncryptedQueryOptions, EncryptionOptions};
pub use lock::{LockOptions, UnlockDataset, UnlockFailure, UnlockOptions, UnlockResult};
pub use processes::ProcessUsage;
pub use quota::{QuotaEntry, QuotaEntryType, QuotaQueryType};
pub use summary::{EncryptionSummary, EncryptionSummaryOptions};
pub use validate::{
    DatasetCreate, DatasetProperties, DatasetUpdate, PropertyValue, UserProperty,
    UserPropertyUpdate,
};

// Re-export extension points
pub use attachments::{
    Attachment, AttachmentDelegate, AttachmentQueryOptions, AttachmentRegistry, StaticDelegate,
};
pub use collaborators::{
    AccountResolver, AclManager, Collaborators, IscsiCoordinator, JbofReport, PathAclInfo,
    Platform, ServiceController, Standalone,
};
pub use jobs::{Job, JobLocks, JobProgress};
pub use periodic::KeySyncTask;
