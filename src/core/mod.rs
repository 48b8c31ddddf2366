pub mod clone;
pub mod poll;
pub mod proxmox;
pub mod vm;

pub use proxmox::{ClusterApi, HttpMethod, ProxmoxClient};
