use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    #[serde(rename = "qemu")]
    Vm,
    Pool,
    Node,
    #[serde(other)]
    Other,
}

/// One row of `cluster/resources`. Never cached: every decision re-fetches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualResource {
    #[serde(rename = "type")]
    pub kind: ResourceKind,
    /// Owning pool for VMs, the pool's own id for pool rows.
    #[serde(default)]
    pub pool: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub vmid: Option<u32>,
    #[serde(default)]
    pub node: Option<String>,
    /// Allocated memory in bytes.
    #[serde(default)]
    pub maxmem: u64,
    #[serde(default, deserialize_with = "bool_from_int")]
    pub template: bool,
    #[serde(default)]
    pub status: Option<String>,
}

impl VirtualResource {
    pub fn is_vm(&self) -> bool {
        self.kind == ResourceKind::Vm
    }

    pub fn in_pool(&self, pool: &str) -> bool {
        self.pool.as_deref() == Some(pool)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }
}

/// Proxmox encodes flags as 0/1, sometimes as booleans.
fn bool_from_int<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(b) => b,
        Value::Number(n) => n.as_u64().unwrap_or(0) != 0,
        Value::String(s) => s == "1" || s.eq_ignore_ascii_case("true"),
        _ => false,
    })
}

/// A VM that exists on the cluster and is addressable by node + vmid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRef {
    pub node: String,
    pub vmid: u32,
    pub name: String,
}

impl VmRef {
    pub fn path(&self, suffix: &str) -> String {
        vm_path(&self.node, self.vmid, suffix)
    }
}

pub fn vm_path(node: &str, vmid: u32, suffix: &str) -> String {
    if suffix.is_empty() {
        format!("nodes/{}/qemu/{}", node, vmid)
    } else {
        format!("nodes/{}/qemu/{}/{}", node, vmid, suffix)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VmStatus {
    pub status: String,
}

impl VmStatus {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }

    /// Running or stopped: the VM exists and is not mid-transition.
    pub fn is_settled(&self) -> bool {
        self.status == "running" || self.status == "stopped"
    }
}

/// The subset of a VM's live config the engine reads.
#[derive(Debug, Clone, Default)]
pub struct VmConfig {
    pub entries: Map<String, Value>,
}

impl VmConfig {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).and_then(Value::as_str)
    }

    /// Set while the cluster still has background disk work running.
    pub fn lock(&self) -> Option<&str> {
        self.get("lock").filter(|l| !l.is_empty())
    }

    pub fn has_interface(&self, key: &str) -> bool {
        self.get(key).is_some()
    }
}

impl<'de> Deserialize<'de> for VmConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self {
            entries: Map::deserialize(deserializer)?,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemoryUsage {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub used: u64,
}

/// `nodes/{node}/status`
#[derive(Debug, Clone, Deserialize)]
pub struct NodeStatus {
    /// Utilization fraction, 0.0..=1.0.
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub memory: MemoryUsage,
}

/// `nodes/{node}/storage/{storage}/status`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageStatus {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub used: u64,
}

/// A volume listed by `nodes/{node}/storage/{storage}/content`.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageVolume {
    pub volid: String,
    #[serde(default)]
    pub size: u64,
}
