use serde_json::json;
use std::fmt;
use tracing::{debug, info, warn};

use crate::cluster::{destroy_vm, next_vmid, vm_config, vm_status};
use crate::core::poll::{poll_until_or_compensate, PollPolicy};
use crate::core::proxmox::{call_unit, ClusterApi, HttpMethod};
use crate::core::vm::{VirtualResource, VmRef};
use crate::errors::{KaminoError, KaminoResult};
use crate::lock::{DistributedLock, VMID_LOCK};
use crate::scheduler::select_best_node;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneState {
    Requested,
    Submitted,
    Polling,
    Verified,
    TimedOut,
}

impl fmt::Display for CloneState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloneState::Requested => write!(f, "requested"),
            CloneState::Submitted => write!(f, "submitted"),
            CloneState::Polling => write!(f, "polling"),
            CloneState::Verified => write!(f, "verified"),
            CloneState::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// One VM clone: source, destination pool, and whatever has been assigned so far.
#[derive(Debug)]
pub struct CloneOperation {
    pub source: VirtualResource,
    pub name: String,
    pub pool: String,
    pub vmid: Option<u32>,
    pub node: Option<String>,
    state: CloneState,
}

impl CloneOperation {
    pub fn new(source: VirtualResource, name: impl Into<String>, pool: impl Into<String>) -> Self {
        Self {
            source,
            name: name.into(),
            pool: pool.into(),
            vmid: None,
            node: None,
            state: CloneState::Requested,
        }
    }

    pub fn state(&self) -> CloneState {
        self.state
    }

    fn advance(&mut self, next: CloneState) {
        debug!(name = %self.name, from = %self.state, to = %next, vmid = ?self.vmid, "clone state");
        self.state = next;
    }
}

/// Drives clone operations through submit, poll and verify.
pub struct Cloner<'a> {
    api: &'a dyn ClusterApi,
    lock: &'a DistributedLock,
    nodes: &'a [String],
    policy: PollPolicy,
}

impl<'a> Cloner<'a> {
    pub fn new(
        api: &'a dyn ClusterApi,
        lock: &'a DistributedLock,
        nodes: &'a [String],
        policy: PollPolicy,
    ) -> Self {
        Self {
            api,
            lock,
            nodes,
            policy,
        }
    }

    /// Runs the whole state machine. On success the returned node is always
    /// the one passed as the clone's `target`.
    pub async fn run(&self, op: &mut CloneOperation) -> KaminoResult<VmRef> {
        let (node, vmid) = self.submit(op).await?;
        op.vmid = Some(vmid);
        op.node = Some(node.clone());
        op.advance(CloneState::Submitted);

        op.advance(CloneState::Polling);
        match self.wait_until_usable(&node, vmid).await {
            Ok(()) => {
                op.advance(CloneState::Verified);
                info!(name = %op.name, vmid, node = %node, "Clone verified");
                Ok(VmRef {
                    node,
                    vmid,
                    name: op.name.clone(),
                })
            }
            Err(e) => {
                if matches!(e, KaminoError::Timeout { .. }) {
                    op.advance(CloneState::TimedOut);
                }
                warn!(name = %op.name, vmid, error = %e, "Clone did not become usable");
                Err(e)
            }
        }
    }

    /// Allocates the vmid, picks the destination and submits the clone, all
    /// under `lock:vmid`. The lock is dropped as soon as the cluster accepts
    /// the request.
    async fn submit(&self, op: &CloneOperation) -> KaminoResult<(String, u32)> {
        let source_node = op
            .source
            .node
            .clone()
            .ok_or_else(|| KaminoError::NotFound(format!("node of template {}", op.name)))?;
        let source_vmid = op
            .source
            .vmid
            .ok_or_else(|| KaminoError::NotFound(format!("vmid of template {}", op.name)))?;

        self.lock
            .with_lock(VMID_LOCK, || async {
                let vmid = next_vmid(self.api).await?;
                let target = select_best_node(self.api, self.nodes).await?;
                let body = json!({
                    "newid": vmid,
                    "name": op.name,
                    "pool": op.pool,
                    "target": target,
                });
                call_unit(
                    self.api,
                    HttpMethod::Post,
                    &format!("nodes/{}/qemu/{}/clone", source_node, source_vmid),
                    Some(&body),
                )
                .await?;
                info!(name = %op.name, vmid, target = %target, pool = %op.pool, "Clone submitted");
                Ok((target, vmid))
            })
            .await
    }

    /// Usable means settled (running or stopped) and no config lock left by
    /// background disk work. On timeout the half-made VM is stopped and deleted.
    async fn wait_until_usable(&self, node: &str, vmid: u32) -> KaminoResult<()> {
        let api = self.api;
        poll_until_or_compensate(
            self.policy,
            &format!("clone of vm {} on {}", vmid, node),
            || async move {
                let status = vm_status(api, node, vmid).await?;
                if !status.is_settled() {
                    return Ok(None);
                }
                let config = vm_config(api, node, vmid).await?;
                if let Some(lock) = config.lock() {
                    debug!(vmid, lock, "vm still locked");
                    return Ok(None);
                }
                Ok(Some(()))
            },
            || destroy_vm(api, node, vmid),
        )
        .await
    }
}
