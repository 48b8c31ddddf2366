use std::collections::HashMap;
use tracing::{debug, info};

use crate::cluster::{list_vms, node_status};
use crate::core::proxmox::ClusterApi;
use crate::core::vm::{NodeStatus, VirtualResource};
use crate::errors::{KaminoError, KaminoResult};

const FREE_MEMORY_WEIGHT: f64 = 0.40;
const FREE_CPU_WEIGHT: f64 = 0.25;
const UNALLOCATED_MEMORY_WEIGHT: f64 = 0.30;
const INVERSE_DENSITY_WEIGHT: f64 = 0.05;

/// Normalized headroom of one node, each ratio in 0.0..=1.0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeMetrics {
    pub free_mem: f64,
    pub free_cpu: f64,
    pub unallocated_mem: f64,
    pub inverse_density: f64,
}

impl NodeMetrics {
    pub fn score(&self) -> f64 {
        FREE_MEMORY_WEIGHT * self.free_mem
            + FREE_CPU_WEIGHT * self.free_cpu
            + UNALLOCATED_MEMORY_WEIGHT * self.unallocated_mem
            + INVERSE_DENSITY_WEIGHT * self.inverse_density
    }

    pub fn from_observations(status: &NodeStatus, load: NodeLoad, cluster_vm_count: usize) -> Self {
        let total = status.memory.total as f64;
        let ratio = |part: f64| if total > 0.0 { 1.0 - part / total } else { 0.0 };
        let inverse_density = if cluster_vm_count > 0 {
            1.0 - load.vm_count as f64 / cluster_vm_count as f64
        } else {
            1.0
        };

        Self {
            free_mem: ratio(status.memory.used as f64),
            free_cpu: 1.0 - status.cpu,
            unallocated_mem: ratio(load.allocated_memory as f64),
            inverse_density,
        }
    }
}

/// What the inventory says is placed on a node, running or not.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeLoad {
    pub vm_count: usize,
    pub allocated_memory: u64,
}

/// Per-node density and allocated memory over non-template VMs, plus the
/// cluster-wide non-template VM count.
pub fn node_loads(inventory: &[VirtualResource]) -> (HashMap<String, NodeLoad>, usize) {
    let mut loads: HashMap<String, NodeLoad> = HashMap::new();
    let mut total = 0;
    for vm in inventory.iter().filter(|r| r.is_vm() && !r.template) {
        total += 1;
        if let Some(node) = &vm.node {
            let load = loads.entry(node.clone()).or_default();
            load.vm_count += 1;
            load.allocated_memory += vm.maxmem;
        }
    }
    (loads, total)
}

/// Highest score wins; ties go to the node listed first in `nodes`.
pub fn pick_best<'a>(scored: impl IntoIterator<Item = (&'a str, f64)>) -> Option<&'a str> {
    let mut best: Option<(&str, f64)> = None;
    for (node, score) in scored {
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((node, score)),
        }
    }
    best.map(|(node, _)| node)
}

/// Chooses the destination node for one clone. Fails if any node's status
/// cannot be read; no node is skipped silently.
pub async fn select_best_node(api: &dyn ClusterApi, nodes: &[String]) -> KaminoResult<String> {
    if nodes.is_empty() {
        return Err(KaminoError::Config("no compute nodes configured".to_string()));
    }

    let inventory = list_vms(api).await?;
    let (loads, cluster_vm_count) = node_loads(&inventory);

    let mut scored = Vec::with_capacity(nodes.len());
    for node in nodes {
        let status = node_status(api, node).await?;
        let load = loads.get(node).copied().unwrap_or_default();
        let metrics = NodeMetrics::from_observations(&status, load, cluster_vm_count);
        let score = metrics.score();
        debug!(node = %node, score, ?metrics, "node scored");
        scored.push((node.as_str(), score));
    }

    let best = pick_best(scored.iter().copied())
        .ok_or_else(|| KaminoError::Config("no compute nodes configured".to_string()))?
        .to_string();
    info!(node = %best, "Selected clone destination");
    Ok(best)
}
