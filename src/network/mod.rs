//! Pod-scoped SDN networks.
//!
//! Every pod gets a VLAN-aware vnet `kamino<n>` tagged `vlan_base + n` in a
//! fixed zone. Vnets are created at most once and never removed here. SDN
//! objects are staged until applied cluster-wide, so a fresh vnet is
//! followed by an apply.

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::info;

use crate::cluster::{update_vm_config, vm_config};
use crate::core::proxmox::{call, call_unit, ClusterApi, HttpMethod};
use crate::core::vm::VmRef;
use crate::errors::{KaminoError, KaminoResult};
use crate::lock::{DistributedLock, SDN_LOCK};

#[derive(Debug, Clone, Deserialize)]
pub struct Vnet {
    pub vnet: String,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub tag: Option<u32>,
}

pub fn vnet_name(pod_number: u16) -> String {
    format!("kamino{}", pod_number)
}

pub fn vlan_tag(vlan_base: u16, pod_number: u16) -> u32 {
    u32::from(vlan_base) + u32::from(pod_number)
}

pub async fn list_vnets(api: &dyn ClusterApi) -> KaminoResult<Vec<Vnet>> {
    call(api, HttpMethod::Get, "cluster/sdn/vnets", None).await
}

pub async fn vnet_exists(api: &dyn ClusterApi, pod_number: u16) -> KaminoResult<bool> {
    let name = vnet_name(pod_number);
    Ok(list_vnets(api).await?.iter().any(|v| v.vnet == name))
}

/// Stages the vnet. Callers must [`apply_sdn_changes`] afterwards.
pub async fn create_vnet(
    api: &dyn ClusterApi,
    zone: &str,
    vlan_base: u16,
    pod_number: u16,
) -> KaminoResult<String> {
    let name = vnet_name(pod_number);
    let body = json!({
        "vnet": name,
        "zone": zone,
        "tag": vlan_tag(vlan_base, pod_number),
        "vlanaware": 1,
    });
    call_unit(api, HttpMethod::Post, "cluster/sdn/vnets", Some(&body)).await?;
    info!(vnet = %name, zone, tag = vlan_tag(vlan_base, pod_number), "Vnet created");
    Ok(name)
}

pub async fn apply_sdn_changes(api: &dyn ClusterApi) -> KaminoResult<()> {
    call_unit(api, HttpMethod::Put, "cluster/sdn", None).await?;
    info!("SDN changes applied");
    Ok(())
}

/// Makes sure the pod's vnet exists. Check, create and apply run under
/// `lock:sdn` since the apply is cluster-wide. Returns the vnet name and
/// whether this call created it.
pub async fn ensure_vnet(
    api: &dyn ClusterApi,
    lock: &DistributedLock,
    zone: &str,
    vlan_base: u16,
    pod_number: u16,
) -> KaminoResult<(String, bool)> {
    lock.with_lock(SDN_LOCK, || async {
        if vnet_exists(api, pod_number).await? {
            return Ok((vnet_name(pod_number), false));
        }
        let name = create_vnet(api, zone, vlan_base, pod_number).await?;
        apply_sdn_changes(api).await?;
        Ok((name, true))
    })
    .await
}

/// Swaps the `bridge=` token of an interface definition, leaving every other
/// option untouched. Adds one if the definition has none.
pub fn replace_bridge(interface: &str, bridge: &str) -> String {
    let mut replaced = false;
    let mut parts: Vec<String> = interface
        .split(',')
        .map(|part| {
            if part.starts_with("bridge=") {
                replaced = true;
                format!("bridge={}", bridge)
            } else {
                part.to_string()
            }
        })
        .collect();
    if !replaced {
        parts.push(format!("bridge={}", bridge));
    }
    parts.join(",")
}

/// Which interface faces the pod network: `net0` on single-NIC VMs, `net1`
/// on dual-NIC routers whose `net0` is the WAN side.
pub fn pod_interface(has_net1: bool) -> &'static str {
    if has_net1 {
        "net1"
    } else {
        "net0"
    }
}

pub async fn rewire_vm(api: &dyn ClusterApi, vm: &VmRef, bridge: &str) -> KaminoResult<()> {
    let config = vm_config(api, &vm.node, vm.vmid).await?;
    let key = pod_interface(config.has_interface("net1"));
    let current = config
        .get(key)
        .ok_or_else(|| KaminoError::NotFound(format!("{} on vm {}", key, vm.vmid)))?;

    let updated = replace_bridge(current, bridge);
    let mut changes = Map::new();
    changes.insert(key.to_string(), Value::String(updated));
    update_vm_config(api, vm, &Value::Object(changes)).await?;
    info!(vmid = vm.vmid, interface = key, bridge, "Vm rewired");
    Ok(())
}
