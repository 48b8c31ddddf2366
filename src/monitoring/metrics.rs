// Cluster usage report behind GET /resources and `kamino-pod-manager resources`.
//
// Each configured node is asked for its status and for the status of the
// storage pool clones land on. Nodes that fail to answer are listed instead
// of failing the whole report; only an all-nodes failure is an error.

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cluster::{node_status, storage_status};
use crate::core::proxmox::ClusterApi;
use crate::errors::{KaminoError, KaminoResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeUsage {
    pub node: String,
    /// Utilization fraction, 0.0..=1.0.
    pub cpu: f64,
    pub memory_total: u64,
    pub memory_used: u64,
    pub storage_total: u64,
    pub storage_used: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UsageTotals {
    pub cpu: f64,
    pub memory_total: u64,
    pub memory_used: u64,
    pub storage_total: u64,
    pub storage_used: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeError {
    pub node: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterUsage {
    pub nodes: Vec<NodeUsage>,
    pub totals: UsageTotals,
    pub errors: Vec<NodeError>,
}

impl ClusterUsage {
    pub fn is_partial(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Memory and storage are summed; CPU is the mean over nodes that answered.
pub fn totals(nodes: &[NodeUsage]) -> UsageTotals {
    let mut totals = nodes.iter().fold(UsageTotals::default(), |mut acc, n| {
        acc.cpu += n.cpu;
        acc.memory_total += n.memory_total;
        acc.memory_used += n.memory_used;
        acc.storage_total += n.storage_total;
        acc.storage_used += n.storage_used;
        acc
    });
    if !nodes.is_empty() {
        totals.cpu /= nodes.len() as f64;
    }
    totals
}

async fn node_usage(api: &dyn ClusterApi, node: &str, storage_id: &str) -> KaminoResult<NodeUsage> {
    let (status, storage) = tokio::join!(node_status(api, node), storage_status(api, node, storage_id));
    let (status, storage) = (status?, storage?);
    Ok(NodeUsage {
        node: node.to_string(),
        cpu: status.cpu,
        memory_total: status.memory.total,
        memory_used: status.memory.used,
        storage_total: storage.total,
        storage_used: storage.used,
    })
}

pub async fn collect_cluster_usage(
    api: &dyn ClusterApi,
    nodes: &[String],
    storage_id: &str,
) -> KaminoResult<ClusterUsage> {
    if nodes.is_empty() {
        return Err(KaminoError::Config("no nodes configured".to_string()));
    }

    let results = join_all(nodes.iter().map(|node| async move {
        (node, node_usage(api, node, storage_id).await)
    }))
    .await;

    let mut usage = Vec::new();
    let mut errors = Vec::new();
    for (node, result) in results {
        match result {
            Ok(u) => usage.push(u),
            Err(e) => {
                warn!(node = %node, error = %e, "Could not read node usage");
                errors.push(NodeError {
                    node: node.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    if usage.is_empty() {
        let detail: Vec<String> = errors.iter().map(|e| format!("{}: {}", e.node, e.error)).collect();
        return Err(KaminoError::Transient(format!(
            "no node answered: {}",
            detail.join("; ")
        )));
    }

    info!(nodes = usage.len(), failed = errors.len(), "Collected cluster usage");
    Ok(ClusterUsage {
        totals: totals(&usage),
        nodes: usage,
        errors,
    })
}
