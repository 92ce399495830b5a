//! Service modules for callback ingestion and reconciliation

pub mod callback_processor;
pub mod cleanup;
pub mod provider;
pub mod stem_reconciler;
pub mod stems;
pub mod storage;
pub mod uploader;

pub use callback_processor::{CallbackProcessor, ProcessOutcome, VersionCache};
pub use cleanup::CleanupDaemon;
pub use provider::{ProviderApi, ProviderClient, ProviderError, StemTaskStatus};
pub use stem_reconciler::{StemReconciler, StemSyncError, StemSyncOutcome, StemSyncRequest};
pub use stems::{determine_separation_mode, extract_assets, StemAsset};
pub use storage::{HttpObjectStorage, ObjectStorage, StorageError};
pub use uploader::VariantUploader;
