use futures_util::future::join_all;
use tracing::{info, warn};

use super::{is_pod_name, owns_pod, PodManager, PodOutcome, PodReport};
use crate::cluster::{delete_pool, delete_vm, pool_exists, pool_members, stop_vm, vm_status};
use crate::core::poll::poll_until;
use crate::core::vm::VirtualResource;
use crate::errors::{KaminoError, KaminoResult};
use crate::users::Identity;

/// Non-admins may only remove pods whose name ends in `_<their username>`.
/// Needs no cluster access, so callers can reject before queueing anything.
pub fn authorize_deletion(pod_name: &str, caller: &Identity) -> KaminoResult<()> {
    if caller.is_admin || owns_pod(pod_name.trim(), &caller.username) {
        return Ok(());
    }
    Err(KaminoError::Authorization(format!(
        "{} does not own pod {}",
        caller.username,
        pod_name.trim()
    )))
}

impl PodManager {
    /// Tears a pod down: stop and delete every member VM, wait for the pool
    /// to drain, then remove the pool.
    pub async fn deprovision_pod(&self, pod_name: &str, caller: &Identity) -> KaminoResult<PodReport> {
        let pod_name = pod_name.trim();
        authorize_deletion(pod_name, caller)?;
        if !is_pod_name(pod_name) || !pool_exists(self.api(), pod_name).await? {
            return Err(KaminoError::NotFound(format!("pod {}", pod_name)));
        }

        let members = pool_members(self.api(), pod_name).await?;
        info!(pod = pod_name, members = members.len(), by = %caller.username, "Deprovisioning pod");

        let mut errors: Vec<String> = join_all(members.iter().map(|vm| self.remove_member(vm)))
            .await
            .into_iter()
            .filter_map(Result::err)
            .map(|e| e.to_string())
            .collect();

        if !members.is_empty() {
            let api = self.api();
            let drained = poll_until(
                self.settings().polling.pool_empty_policy(),
                &format!("pool {} to empty", pod_name),
                || async move { Ok(pool_members(api, pod_name).await?.is_empty().then_some(())) },
            )
            .await;
            if let Err(e) = drained {
                errors.push(e.to_string());
            }
        }

        let outcome = match delete_pool(self.api(), pod_name).await {
            Ok(()) if errors.is_empty() => PodOutcome::Complete,
            Ok(()) => PodOutcome::Partial,
            Err(e) => {
                errors.push(format!("deleting pool {}: {}", pod_name, e));
                PodOutcome::Failed
            }
        };

        if outcome.is_success() {
            info!(pod = pod_name, "Pod deprovisioned");
        } else {
            warn!(pod = pod_name, errors = ?errors, "Pod deprovisioned with errors");
        }
        Ok(PodReport::new(pod_name, outcome, errors))
    }

    /// A stop failure is tolerated when the VM is already stopped.
    async fn remove_member(&self, vm: &VirtualResource) -> KaminoResult<()> {
        let (Some(node), Some(vmid)) = (vm.node.as_deref(), vm.vmid) else {
            return Err(KaminoError::Decode(format!(
                "pool member {} has no node or vmid",
                vm.display_name()
            )));
        };
        let api = self.api();

        if let Err(e) = stop_vm(api, node, vmid).await {
            warn!(vmid, error = %e, "Stop request failed, checking current state");
        }
        poll_until(
            self.settings().polling.clone_policy(),
            &format!("vm {} to stop", vmid),
            || async move {
                let status = vm_status(api, node, vmid).await?;
                Ok((status.status == "stopped").then_some(()))
            },
        )
        .await?;

        delete_vm(api, node, vmid).await
    }
}
