pub mod api;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod core;
pub mod errors;
pub mod jobs;
pub mod lock;
pub mod monitoring;
pub mod network;
pub mod pods;
pub mod router;
pub mod scheduler;
pub mod templates;
pub mod users;

// Re-exports
pub use api::{create_router, AppState};
pub use config::Settings;
pub use core::proxmox::{ClusterApi, ProxmoxClient};
pub use errors::{ErrorKind, KaminoError, KaminoResult};
pub use jobs::JobQueue;
pub use lock::DistributedLock;
pub use pods::{PodManager, PodOutcome, PodReport};
pub use users::Identity;
