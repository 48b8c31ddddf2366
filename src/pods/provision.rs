use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::{next_pod_id, pod_id_prefix, pod_pool_name, PodId, PodManager, PodOutcome, PodReport};
use crate::cluster::{
    create_pool, delete_pool, grant_pool_access, list_pools, list_vms, pool_members, start_vm,
    vm_disks, vm_status,
};
use crate::core::clone::{CloneOperation, Cloner};
use crate::core::poll::poll_until;
use crate::core::vm::{VirtualResource, VmRef};
use crate::errors::{KaminoError, KaminoResult};
use crate::lock::POD_ID_LOCK;
use crate::network::{ensure_vnet, rewire_vm};
use crate::router::RouterConfigurator;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkReport {
    pub template: String,
    pub pods: Vec<PodReport>,
    pub skipped: usize,
    pub message: String,
}

/// What a template resolves to: the VMs to clone plus the pod router.
struct PodSources {
    vms: Vec<VirtualResource>,
    router: Option<VirtualResource>,
}

impl PodManager {
    /// Creates one pod from `template` for `owner`.
    ///
    /// Hard errors (template missing, no ids, pool creation failing) return
    /// `Err` before anything is cloned. After that every step failure is
    /// recorded in the report and the remaining steps still run.
    pub async fn provision_pod(&self, template: &str, owner: &str) -> KaminoResult<PodReport> {
        let template = template.trim();
        let owner = owner.trim();
        if template.is_empty() || owner.is_empty() {
            return Err(KaminoError::NotFound("template and owner are required".to_string()));
        }

        let sources = self.resolve_template(template).await?;
        let (pod_id, pool) = self.reserve_pod(template, owner).await?;
        info!(pod = %pool, vms = sources.vms.len(), "Provisioning pod");

        let mut errors = Vec::new();
        let (router, mut cloned) = self.clone_all(&pool, pod_id, sources, &mut errors).await;
        if let Some(router) = &router {
            cloned.push(router.clone());
        }
        if cloned.is_empty() {
            return Ok(self.settle_failed_pod(pool, errors).await);
        }

        self.wire_network(pod_id, &cloned, &mut errors).await;

        if let Some(router) = &router {
            if let Err(e) = self.bring_up_router(router, pod_id).await {
                warn!(pod = %pool, error = %e, "Router setup failed");
                errors.push(format!("router: {}", e));
            }
        }

        let user = format!("{}@{}", owner, self.settings().proxmox.user_realm);
        if let Err(e) =
            grant_pool_access(self.api(), &pool, &user, &self.settings().provisioning.pod_roles).await
        {
            errors.push(format!("granting access to {}: {}", user, e));
        }

        if !errors.is_empty() {
            return Ok(self.settle_failed_pod(pool, errors).await);
        }

        if let Err(e) = self.templates().record_deployment(template).await {
            warn!(template, error = %e, "Could not record deployment");
        }
        info!(pod = %pool, "Pod provisioned");
        Ok(PodReport::new(pool, PodOutcome::Complete, errors))
    }

    /// Provisions one pod per non-blank owner, concurrently. Fails with the
    /// first hard error once every owner's attempt has finished; pods left
    /// partial are reported, not treated as failures.
    pub async fn provision_bulk(&self, template: &str, owners: &[String]) -> KaminoResult<BulkReport> {
        let targets: Vec<&str> = owners
            .iter()
            .map(|o| o.trim())
            .filter(|o| !o.is_empty())
            .collect();
        let skipped = owners.len() - targets.len();

        let results = join_all(targets.iter().map(|owner| async move {
            let result = self
                .provision_pod(template, owner)
                .await
                .and_then(PodReport::into_result);
            (*owner, result)
        }))
        .await;

        let mut pods = Vec::with_capacity(results.len());
        let mut first_error = None;
        for (owner, result) in results {
            match result {
                Ok(report) => {
                    if !report.success {
                        warn!(pod = %report.pod_name, errors = ?report.errors, "Bulk pod left partial");
                    }
                    pods.push(report);
                }
                Err(e) => {
                    error!(owner, error = %e, "Bulk pod failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let message = format!("Created {} pods from template {}", pods.len(), template);
        info!(template, created = pods.len(), skipped, "Bulk provisioning done");
        Ok(BulkReport {
            template: template.to_string(),
            pods,
            skipped,
            message,
        })
    }

    /// Fails with `NotFound` when the template pool has no VMs.
    pub async fn check_template(&self, template: &str) -> KaminoResult<()> {
        self.resolve_template(template.trim()).await.map(|_| ())
    }

    async fn resolve_template(&self, template: &str) -> KaminoResult<PodSources> {
        let provisioning = &self.settings().provisioning;
        let template_pool = format!("{}{}", provisioning.template_pool_prefix, template);
        let inventory = list_vms(self.api()).await?;

        let mut vms: Vec<VirtualResource> = inventory
            .iter()
            .filter(|vm| vm.in_pool(&template_pool))
            .cloned()
            .collect();
        if vms.is_empty() {
            return Err(KaminoError::NotFound(format!("template {} has no VMs", template)));
        }
        vms.sort_by_key(|vm| vm.vmid);

        let router = inventory
            .into_iter()
            .find(|vm| vm.in_pool(&provisioning.router_pool) && vm.display_name() == provisioning.router_template);

        Ok(PodSources { vms, router })
    }

    /// Picks the pod id and creates its pool under `lock:podid`, so two
    /// concurrent requests cannot settle on the same id.
    async fn reserve_pod(&self, template: &str, owner: &str) -> KaminoResult<(PodId, String)> {
        self.lock
            .with_lock(POD_ID_LOCK, || async {
                let pools = list_pools(self.api()).await?;
                let pod_id = next_pod_id(pools.iter().filter_map(|p| pod_id_prefix(p)))?;
                let pool = pod_pool_name(pod_id, template, owner);
                create_pool(self.api(), &pool).await?;
                Ok((pod_id, pool))
            })
            .await
    }

    /// Clones the router and every template VM. A failed clone is recorded
    /// and the rest carry on.
    async fn clone_all(
        &self,
        pool: &str,
        pod_id: PodId,
        sources: PodSources,
        errors: &mut Vec<String>,
    ) -> (Option<VmRef>, Vec<VmRef>) {
        let settings = self.settings();
        let cloner = Cloner::new(
            self.api(),
            &self.lock,
            &settings.proxmox.nodes,
            settings.polling.clone_policy(),
        );
        let cloner = &cloner;

        let router_op = match sources.router {
            Some(source) => Some(CloneOperation::new(source, format!("{}-router", pod_id), pool)),
            None => {
                errors.push(format!(
                    "router template {} not found in pool {}",
                    settings.provisioning.router_template, settings.provisioning.router_pool
                ));
                None
            }
        };
        let vm_ops: Vec<CloneOperation> = sources
            .vms
            .into_iter()
            .map(|source| {
                let name = source.display_name().to_string();
                CloneOperation::new(source, name, pool)
            })
            .collect();

        let run = |mut op: CloneOperation| async move {
            let result = cloner.run(&mut op).await;
            (op.name, result)
        };

        let router_task = async {
            match router_op {
                Some(op) => Some(run(op).await),
                None => None,
            }
        };
        let (router_result, vm_results) =
            tokio::join!(router_task, join_all(vm_ops.into_iter().map(&run)));

        let mut router = None;
        if let Some((name, result)) = router_result {
            match result {
                Ok(vm) => router = Some(vm),
                Err(e) => errors.push(format!("clone {}: {}", name, e)),
            }
        }

        let mut cloned = Vec::new();
        for (name, result) in vm_results {
            match result {
                Ok(vm) => cloned.push(vm),
                Err(e) => errors.push(format!("clone {}: {}", name, e)),
            }
        }
        (router, cloned)
    }

    async fn wire_network(&self, pod_id: PodId, vms: &[VmRef], errors: &mut Vec<String>) {
        let provisioning = &self.settings().provisioning;
        let bridge = match ensure_vnet(
            self.api(),
            &self.lock,
            &provisioning.sdn_zone,
            provisioning.vlan_base,
            pod_id.number(),
        )
        .await
        {
            Ok((bridge, _created)) => bridge,
            Err(e) => {
                errors.push(format!("network for pod {}: {}", pod_id, e));
                return;
            }
        };

        for vm in vms {
            if let Err(e) = rewire_vm(self.api(), vm, &bridge).await {
                errors.push(format!("rewiring {} ({}): {}", vm.name, vm.vmid, e));
            }
        }
    }

    /// Disk attach lags clone completion, so wait for it before booting.
    async fn bring_up_router(&self, router: &VmRef, pod_id: PodId) -> KaminoResult<()> {
        let api = self.api();
        let settings = self.settings();
        let storage = settings.proxmox.storage_id.as_str();

        poll_until(
            settings.polling.disk_policy(),
            &format!("disk of router {}", router.vmid),
            || async move {
                let disks = vm_disks(api, router, storage).await?;
                Ok(disks.iter().any(|d| d.size > 0).then_some(()))
            },
        )
        .await?;

        start_vm(api, &router.node, router.vmid).await?;
        poll_until(
            settings.polling.clone_policy(),
            &format!("router {} to run", router.vmid),
            || async move {
                let status = vm_status(api, &router.node, router.vmid).await?;
                Ok(status.is_running().then_some(()))
            },
        )
        .await?;

        RouterConfigurator::new(api, &settings.router, settings.polling.agent_policy())
            .configure(router, pod_id.number())
            .await
    }

    /// An empty pool is removed; anything with members stays for inspection.
    async fn settle_failed_pod(&self, pool: String, mut errors: Vec<String>) -> PodReport {
        match pool_members(self.api(), &pool).await {
            Ok(members) if members.is_empty() => match delete_pool(self.api(), &pool).await {
                Ok(()) => {
                    error!(pod = %pool, errors = ?errors, "Pod rolled back");
                    PodReport::new(pool, PodOutcome::RolledBack, errors)
                }
                Err(e) => {
                    errors.push(format!("rollback of pool {}: {}", pool, e));
                    PodReport::new(pool, PodOutcome::Failed, errors)
                }
            },
            Ok(members) => {
                warn!(pod = %pool, members = members.len(), errors = ?errors, "Pod left partially provisioned");
                PodReport::new(pool, PodOutcome::Partial, errors)
            }
            Err(e) => {
                errors.push(format!("counting members of {}: {}", pool, e));
                PodReport::new(pool, PodOutcome::Partial, errors)
            }
        }
    }
}
