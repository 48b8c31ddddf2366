//! Thin, typed wrappers over the gateway for the calls the engine makes.
//! Everything here re-reads cluster state; nothing is cached.

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::core::proxmox::{call, call_unit, ClusterApi, HttpMethod};
use crate::core::vm::{
    vm_path, NodeStatus, ResourceKind, StorageStatus, StorageVolume, VirtualResource, VmConfig,
    VmRef, VmStatus,
};
use crate::errors::{KaminoError, KaminoResult};

pub async fn cluster_resources(api: &dyn ClusterApi) -> KaminoResult<Vec<VirtualResource>> {
    call(api, HttpMethod::Get, "cluster/resources", None).await
}

pub async fn list_vms(api: &dyn ClusterApi) -> KaminoResult<Vec<VirtualResource>> {
    Ok(cluster_resources(api)
        .await?
        .into_iter()
        .filter(VirtualResource::is_vm)
        .collect())
}

pub async fn list_pools(api: &dyn ClusterApi) -> KaminoResult<Vec<String>> {
    Ok(cluster_resources(api)
        .await?
        .into_iter()
        .filter(|r| r.kind == ResourceKind::Pool)
        .filter_map(|r| r.pool)
        .collect())
}

pub async fn pool_exists(api: &dyn ClusterApi, pool: &str) -> KaminoResult<bool> {
    Ok(list_pools(api).await?.iter().any(|p| p == pool))
}

pub async fn pool_members(api: &dyn ClusterApi, pool: &str) -> KaminoResult<Vec<VirtualResource>> {
    Ok(list_vms(api)
        .await?
        .into_iter()
        .filter(|vm| vm.in_pool(pool))
        .collect())
}

pub async fn create_pool(api: &dyn ClusterApi, pool: &str) -> KaminoResult<()> {
    call_unit(api, HttpMethod::Post, "pools", Some(&json!({ "poolid": pool }))).await?;
    info!(pool, "Resource pool created");
    Ok(())
}

pub async fn delete_pool(api: &dyn ClusterApi, pool: &str) -> KaminoResult<()> {
    call_unit(api, HttpMethod::Delete, &format!("pools/{}", pool), None).await?;
    info!(pool, "Resource pool deleted");
    Ok(())
}

/// Asks the cluster for the next unused VM id. Only meaningful under `lock:vmid`.
pub async fn next_vmid(api: &dyn ClusterApi) -> KaminoResult<u32> {
    let raw: Value = call(api, HttpMethod::Get, "cluster/nextid", None).await?;
    let id = match &raw {
        Value::String(s) => s.trim().parse::<u32>().ok(),
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        _ => None,
    };
    id.ok_or_else(|| KaminoError::Decode(format!("cluster/nextid returned {}", raw)))
}

pub async fn node_status(api: &dyn ClusterApi, node: &str) -> KaminoResult<NodeStatus> {
    call(api, HttpMethod::Get, &format!("nodes/{}/status", node), None).await
}

pub async fn storage_status(
    api: &dyn ClusterApi,
    node: &str,
    storage: &str,
) -> KaminoResult<StorageStatus> {
    call(
        api,
        HttpMethod::Get,
        &format!("nodes/{}/storage/{}/status", node, storage),
        None,
    )
    .await
}

pub async fn vm_disks(
    api: &dyn ClusterApi,
    vm: &VmRef,
    storage: &str,
) -> KaminoResult<Vec<StorageVolume>> {
    call(
        api,
        HttpMethod::Get,
        &format!("nodes/{}/storage/{}/content?vmid={}", vm.node, storage, vm.vmid),
        None,
    )
    .await
}

pub async fn vm_status(api: &dyn ClusterApi, node: &str, vmid: u32) -> KaminoResult<VmStatus> {
    call(api, HttpMethod::Get, &vm_path(node, vmid, "status/current"), None).await
}

pub async fn vm_config(api: &dyn ClusterApi, node: &str, vmid: u32) -> KaminoResult<VmConfig> {
    call(api, HttpMethod::Get, &vm_path(node, vmid, "config"), None).await
}

pub async fn update_vm_config(api: &dyn ClusterApi, vm: &VmRef, changes: &Value) -> KaminoResult<()> {
    call_unit(api, HttpMethod::Put, &vm.path("config"), Some(changes)).await
}

pub async fn start_vm(api: &dyn ClusterApi, node: &str, vmid: u32) -> KaminoResult<()> {
    debug!(node, vmid, "starting vm");
    call_unit(api, HttpMethod::Post, &vm_path(node, vmid, "status/start"), None).await
}

pub async fn stop_vm(api: &dyn ClusterApi, node: &str, vmid: u32) -> KaminoResult<()> {
    debug!(node, vmid, "stopping vm");
    call_unit(api, HttpMethod::Post, &vm_path(node, vmid, "status/stop"), None).await
}

pub async fn delete_vm(api: &dyn ClusterApi, node: &str, vmid: u32) -> KaminoResult<()> {
    debug!(node, vmid, "deleting vm");
    call_unit(api, HttpMethod::Delete, &vm_path(node, vmid, ""), None).await
}

/// Stop, then delete. Stop errors do not prevent the delete attempt; both are
/// reported together.
pub async fn destroy_vm(api: &dyn ClusterApi, node: &str, vmid: u32) -> KaminoResult<()> {
    let stopped = stop_vm(api, node, vmid).await;
    let deleted = delete_vm(api, node, vmid).await;
    match (stopped, deleted) {
        (_, Ok(())) => Ok(()),
        (Ok(()), Err(e)) => Err(e),
        (Err(stop), Err(delete)) => Err(KaminoError::Transient(format!(
            "stop vm {}: {}; delete vm {}: {}",
            vmid, stop, vmid, delete
        ))),
    }
}

pub async fn grant_pool_access(
    api: &dyn ClusterApi,
    pool: &str,
    user: &str,
    roles: &[String],
) -> KaminoResult<()> {
    let body = json!({
        "path": format!("/pool/{}", pool),
        "users": user,
        "roles": roles.join(","),
        "propagate": 1,
    });
    call_unit(api, HttpMethod::Put, "access/acl", Some(&body)).await?;
    info!(pool, user, "Pool access granted");
    Ok(())
}
