//! Pod lifecycle: naming, id allocation, and the manager that provisions and
//! tears pods down.
//!
//! A pod is a resource pool named `<podID>_<template>_<owner>`. The name is
//! the only record of the pod; there is no separate pod table.

mod deprovision;
mod provision;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::cluster::cluster_resources;
use crate::config::Settings;
use crate::core::proxmox::ClusterApi;
use crate::core::vm::ResourceKind;
use crate::errors::{KaminoError, KaminoResult};
use crate::lock::DistributedLock;
use crate::monitoring::metrics::{collect_cluster_usage, ClusterUsage};
use crate::templates::TemplateRegistry;

pub use deprovision::authorize_deletion;
pub use provision::BulkReport;

pub const POD_ID_MIN: u16 = 1001;
pub const POD_ID_MAX: u16 = 1255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PodId(u16);

impl PodId {
    pub fn new(id: u16) -> Option<Self> {
        (POD_ID_MIN..=POD_ID_MAX).contains(&id).then_some(Self(id))
    }

    pub fn get(&self) -> u16 {
        self.0
    }

    /// 1..=255; drives the vnet name, VLAN tag and router addressing.
    pub fn number(&self) -> u16 {
        self.0 - 1000
    }
}

impl fmt::Display for PodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The four-digit id a pool name starts with, if it is shaped like a pod.
pub fn pod_id_prefix(name: &str) -> Option<u16> {
    let bytes = name.as_bytes();
    if bytes.len() < 5 || bytes[0] != b'1' || bytes[4] != b'_' {
        return None;
    }
    if !bytes[..4].iter().all(u8::is_ascii_digit) {
        return None;
    }
    name[..4].parse().ok()
}

pub fn is_pod_name(name: &str) -> bool {
    pod_id_prefix(name).is_some()
}

pub fn pod_pool_name(id: PodId, template: &str, owner: &str) -> String {
    format!("{}_{}_{}", id, template, owner)
}

/// Owner check on the name alone: it must end in `_<username>`.
pub fn owns_pod(pod_name: &str, username: &str) -> bool {
    !username.is_empty()
        && pod_name.len() > username.len() + 1
        && pod_name.ends_with(username)
        && pod_name.as_bytes()[pod_name.len() - username.len() - 1] == b'_'
}

/// Smallest id in [1001, 1255] not already taken.
pub fn next_pod_id(existing: impl IntoIterator<Item = u16>) -> KaminoResult<PodId> {
    let mut taken: Vec<u16> = existing.into_iter().collect();
    taken.sort_unstable();
    taken.dedup();

    let mut candidate = POD_ID_MIN;
    for id in taken {
        if id < candidate {
            continue;
        }
        if id > candidate {
            break;
        }
        candidate += 1;
    }

    PodId::new(candidate).ok_or(KaminoError::PodIdsExhausted)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PodOutcome {
    /// Every step succeeded.
    Complete,
    /// Some steps failed; the pod was left in place.
    Partial,
    /// Nothing usable was created; the empty pool was removed.
    RolledBack,
    /// The operation could not finish; cluster state may need attention.
    Failed,
}

impl PodOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PodOutcome::Complete)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodReport {
    pub success: bool,
    pub outcome: PodOutcome,
    pub pod_name: String,
    pub errors: Vec<String>,
}

impl PodReport {
    pub fn new(pod_name: impl Into<String>, outcome: PodOutcome, errors: Vec<String>) -> Self {
        Self {
            success: outcome.is_success(),
            outcome,
            pod_name: pod_name.into(),
            errors,
        }
    }

    /// Complete and partial pods are usable; anything else becomes an error.
    pub fn into_result(self) -> KaminoResult<PodReport> {
        match self.outcome {
            PodOutcome::Complete | PodOutcome::Partial => Ok(self),
            PodOutcome::RolledBack | PodOutcome::Failed => Err(KaminoError::PartialFailure {
                pod: self.pod_name,
                errors: self.errors,
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodVm {
    pub name: String,
    pub vmid: u32,
    pub node: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodSummary {
    pub name: String,
    pub vms: Vec<PodVm>,
}

/// Orchestrates pods against one cluster. Cheap to share behind an `Arc`.
pub struct PodManager {
    api: Arc<dyn ClusterApi>,
    lock: Arc<DistributedLock>,
    templates: Arc<dyn TemplateRegistry>,
    settings: Arc<Settings>,
}

impl PodManager {
    pub fn new(
        api: Arc<dyn ClusterApi>,
        lock: Arc<DistributedLock>,
        templates: Arc<dyn TemplateRegistry>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            api,
            lock,
            templates,
            settings,
        }
    }

    pub fn api(&self) -> &dyn ClusterApi {
        self.api.as_ref()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn templates(&self) -> &Arc<dyn TemplateRegistry> {
        &self.templates
    }

    /// All pods, or only those owned by `owner`.
    pub async fn list_pods(&self, owner: Option<&str>) -> KaminoResult<Vec<PodSummary>> {
        let inventory = cluster_resources(self.api()).await?;

        let mut pods: BTreeMap<String, Vec<PodVm>> = inventory
            .iter()
            .filter(|r| r.kind == ResourceKind::Pool)
            .filter_map(|r| r.pool.clone())
            .filter(|name| is_pod_name(name))
            .filter(|name| owner.map(|o| owns_pod(name, o)).unwrap_or(true))
            .map(|name| (name, Vec::new()))
            .collect();

        for vm in inventory.iter().filter(|r| r.is_vm()) {
            let (Some(pool), Some(vmid)) = (&vm.pool, vm.vmid) else {
                continue;
            };
            if let Some(vms) = pods.get_mut(pool) {
                vms.push(PodVm {
                    name: vm.display_name().to_string(),
                    vmid,
                    node: vm.node.clone().unwrap_or_default(),
                    status: vm.status.clone().unwrap_or_default(),
                });
            }
        }

        Ok(pods
            .into_iter()
            .map(|(name, mut vms)| {
                vms.sort_by_key(|vm| vm.vmid);
                PodSummary { name, vms }
            })
            .collect())
    }

    pub async fn cluster_usage(&self) -> KaminoResult<ClusterUsage> {
        collect_cluster_usage(
            self.api(),
            &self.settings.proxmox.nodes,
            &self.settings.proxmox.storage_id,
        )
        .await
    }
}
