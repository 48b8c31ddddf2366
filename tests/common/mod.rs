// In-memory stand-in for the hypervisor API, shared by the integration suites.
//
// It keeps just enough cluster state (VMs, pools, vnets, ACLs) for the pod
// workflows to run end to end, answers in the `{"data": ...}` envelope, and
// yields on every call so concurrent workflows interleave.

#![allow(dead_code)]

use async_trait::async_trait;
use kamino_pod_manager::config::Settings;
use kamino_pod_manager::core::proxmox::{ApiResponse, ClusterApi, HttpMethod};
use kamino_pod_manager::lock::{DistributedLock, MemoryLockStore};
use kamino_pod_manager::pods::PodManager;
use kamino_pod_manager::templates::InMemoryTemplateRegistry;
use kamino_pod_manager::KaminoResult;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};

pub const NODES: [&str; 2] = ["pve1", "pve2"];
pub const STORAGE: &str = "local-lvm";
pub const ROUTER_TEMPLATE_VMID: u32 = 90;
const GIB: u64 = 1 << 30;

#[derive(Debug, Clone)]
pub struct FakeVm {
    pub vmid: u32,
    pub node: String,
    pub name: String,
    pub pool: Option<String>,
    pub template: bool,
    pub status: String,
    pub maxmem: u64,
    pub config: Map<String, Value>,
    /// Config reads that still report a `lock` after a clone.
    pub lock_reads_left: u32,
    pub disk_ready: bool,
    /// Upcoming (status, locked) answers; the last one sticks.
    pub status_script: VecDeque<(String, bool)>,
    pub scripted_lock: bool,
}

#[derive(Debug, Clone)]
pub struct FakeNode {
    pub cpu: f64,
    pub mem_total: u64,
    pub mem_used: u64,
    pub failing: bool,
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub vms: BTreeMap<u32, FakeVm>,
    pub pools: BTreeSet<String>,
    pub vnets: BTreeMap<String, u32>,
    pub sdn_applies: u32,
    pub acls: Vec<Value>,
    pub execs: Vec<(u32, Vec<String>)>,
    pub calls: Vec<(HttpMethod, String)>,
    pub nodes: BTreeMap<String, FakeNode>,
    /// Config reads a fresh clone keeps its lock for.
    pub clone_lock_reads: u32,
    /// Clones whose lock never clears.
    pub stuck_clones: BTreeSet<String>,
    /// Status sequences a clone of the given name walks through.
    pub clone_scripts: BTreeMap<String, Vec<(String, bool)>>,
    /// (method, path fragment, status) answered before anything else.
    pub failures: Vec<(HttpMethod, String, u16)>,
    /// Pool deletes of non-empty pools are rejected like the real API.
    pub strict_pool_delete: bool,
}

pub struct FakeCluster {
    state: Mutex<FakeState>,
}

fn vm_row(vm: &FakeVm) -> Value {
    json!({
        "type": "qemu",
        "vmid": vm.vmid,
        "name": vm.name,
        "node": vm.node,
        "pool": vm.pool,
        "maxmem": vm.maxmem,
        "template": if vm.template { 1 } else { 0 },
        "status": vm.status,
    })
}

fn ok(data: Value) -> ApiResponse {
    ApiResponse {
        status: 200,
        body: json!({ "data": data }).to_string(),
    }
}

fn fail(status: u16, message: &str) -> ApiResponse {
    ApiResponse {
        status,
        body: json!({ "errors": message }).to_string(),
    }
}

impl FakeCluster {
    pub fn empty() -> Arc<Self> {
        let mut state = FakeState {
            strict_pool_delete: true,
            ..Default::default()
        };
        for (i, node) in NODES.iter().enumerate() {
            state.nodes.insert(
                node.to_string(),
                FakeNode {
                    cpu: 0.1 + i as f64 * 0.2,
                    mem_total: 64 * GIB,
                    mem_used: 16 * GIB,
                    failing: false,
                },
            );
        }
        Arc::new(Self {
            state: Mutex::new(state),
        })
    }

    /// Two template VMs in `kamino_template_web` plus the router template.
    pub fn with_web_template() -> Arc<Self> {
        let cluster = Self::empty();
        cluster.add_template("kamino_template_web", 100, "web-01", false);
        cluster.add_template("kamino_template_web", 101, "db-01", false);
        cluster.add_template("kamino_router", ROUTER_TEMPLATE_VMID, "kamino-router", true);
        cluster
    }

    pub fn add_template(&self, pool: &str, vmid: u32, name: &str, dual_nic: bool) {
        let mut config = Map::new();
        config.insert("name".into(), json!(name));
        config.insert("net0".into(), json!("virtio=BC:24:11:00:00:01,bridge=vmbr0,firewall=1"));
        if dual_nic {
            config.insert("net1".into(), json!("virtio=BC:24:11:00:00:02,bridge=vmbr1"));
        }
        let mut state = self.state();
        state.pools.insert(pool.to_string());
        state.vms.insert(
            vmid,
            FakeVm {
                vmid,
                node: NODES[0].to_string(),
                name: name.to_string(),
                pool: Some(pool.to_string()),
                template: true,
                status: "stopped".to_string(),
                maxmem: 2 * GIB,
                config,
                lock_reads_left: 0,
                disk_ready: true,
                status_script: VecDeque::new(),
                scripted_lock: false,
            },
        );
    }

    /// A plain VM inside an existing or new pool.
    pub fn add_vm(&self, pool: &str, vmid: u32, name: &str, node: &str, status: &str) {
        let mut config = Map::new();
        config.insert("net0".into(), json!("virtio=BC:24:11:00:00:09,bridge=kamino1"));
        let mut state = self.state();
        state.pools.insert(pool.to_string());
        state.vms.insert(
            vmid,
            FakeVm {
                vmid,
                node: node.to_string(),
                name: name.to_string(),
                pool: Some(pool.to_string()),
                template: false,
                status: status.to_string(),
                maxmem: 4 * GIB,
                config,
                lock_reads_left: 0,
                disk_ready: true,
                status_script: VecDeque::new(),
                scripted_lock: false,
            },
        );
    }

    /// Clones named `name` report these (status, locked) pairs in turn.
    pub fn script_clone(&self, name: &str, steps: &[(&str, bool)]) {
        let steps = steps.iter().map(|(s, l)| (s.to_string(), *l)).collect();
        self.state().clone_scripts.insert(name.to_string(), steps);
    }

    pub fn add_pool(&self, pool: &str) {
        self.state().pools.insert(pool.to_string());
    }

    pub fn fail(&self, method: HttpMethod, fragment: &str, status: u16) {
        self.state().failures.push((method, fragment.to_string(), status));
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn calls_matching(&self, method: HttpMethod, fragment: &str) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter(|(m, p)| *m == method && p.contains(fragment))
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn pool_members(&self, pool: &str) -> Vec<FakeVm> {
        self.state()
            .vms
            .values()
            .filter(|vm| vm.pool.as_deref() == Some(pool))
            .cloned()
            .collect()
    }

    fn handle(&self, method: HttpMethod, path: &str, body: Option<&Value>) -> ApiResponse {
        let mut state = self.state();
        state.calls.push((method, path.to_string()));

        if let Some((_, _, status)) = state
            .failures
            .iter()
            .find(|(m, fragment, _)| *m == method && path.contains(fragment.as_str()))
        {
            return fail(*status, "injected failure");
        }

        let (path, query) = match path.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (path, None),
        };
        let segments: Vec<&str> = path.split('/').collect();
        let body = body.cloned().unwrap_or(Value::Null);

        match (method, segments.as_slice()) {
            (HttpMethod::Get, ["cluster", "resources"]) => {
                let mut rows: Vec<Value> = state.vms.values().map(vm_row).collect();
                rows.extend(state.pools.iter().map(|p| json!({ "type": "pool", "pool": p })));
                rows.extend(state.nodes.keys().map(|n| json!({ "type": "node", "node": n })));
                ok(Value::Array(rows))
            }
            (HttpMethod::Get, ["cluster", "nextid"]) => {
                let next = (100..).find(|id| !state.vms.contains_key(id)).unwrap_or(100);
                ok(json!(next.to_string()))
            }
            (HttpMethod::Get, ["cluster", "sdn", "vnets"]) => ok(Value::Array(
                state
                    .vnets
                    .iter()
                    .map(|(name, tag)| json!({ "vnet": name, "zone": "kamino", "tag": tag }))
                    .collect(),
            )),
            (HttpMethod::Post, ["cluster", "sdn", "vnets"]) => {
                let name = body["vnet"].as_str().unwrap_or_default().to_string();
                if state.vnets.contains_key(&name) {
                    return fail(500, "vnet already exists");
                }
                let tag = body["tag"].as_u64().unwrap_or_default() as u32;
                state.vnets.insert(name, tag);
                ok(Value::Null)
            }
            (HttpMethod::Put, ["cluster", "sdn"]) => {
                state.sdn_applies += 1;
                ok(json!("UPID:sdn"))
            }
            (HttpMethod::Post, ["pools"]) => {
                let pool = body["poolid"].as_str().unwrap_or_default().to_string();
                if !state.pools.insert(pool) {
                    return fail(500, "pool already exists");
                }
                ok(Value::Null)
            }
            (HttpMethod::Delete, ["pools", pool]) => {
                let pool = pool.to_string();
                let has_members = state.vms.values().any(|vm| vm.pool.as_deref() == Some(pool.as_str()));
                if state.strict_pool_delete && has_members {
                    return fail(500, "pool is not empty");
                }
                if !state.pools.remove(&pool) {
                    return fail(404, "no such pool");
                }
                ok(Value::Null)
            }
            (HttpMethod::Put, ["access", "acl"]) => {
                state.acls.push(body);
                ok(Value::Null)
            }
            (HttpMethod::Get, ["nodes", node, "status"]) => match state.nodes.get(*node) {
                Some(n) if !n.failing => ok(json!({
                    "cpu": n.cpu,
                    "memory": { "total": n.mem_total, "used": n.mem_used },
                })),
                Some(_) => fail(500, "node offline"),
                None => fail(404, "no such node"),
            },
            (HttpMethod::Get, ["nodes", node, "storage", _, "status"]) => match state.nodes.get(*node) {
                Some(n) if !n.failing => ok(json!({ "total": 1000 * GIB, "used": 250 * GIB })),
                _ => fail(500, "storage offline"),
            },
            (HttpMethod::Get, ["nodes", _, "storage", storage, "content"]) => {
                let vmid: Option<u32> = query
                    .and_then(|q| q.strip_prefix("vmid="))
                    .and_then(|v| v.parse().ok());
                let volumes: Vec<Value> = state
                    .vms
                    .values()
                    .filter(|vm| Some(vm.vmid) == vmid && vm.disk_ready)
                    .map(|vm| json!({ "volid": format!("{}:vm-{}-disk-0", storage, vm.vmid), "size": 8 * GIB }))
                    .collect();
                ok(Value::Array(volumes))
            }
            (method, ["nodes", node, "qemu", vmid, rest @ ..]) => {
                let Ok(vmid) = vmid.parse::<u32>() else {
                    return fail(400, "bad vmid");
                };
                Self::handle_vm(&mut state, method, node, vmid, rest, body)
            }
            _ => fail(501, "not implemented by fake"),
        }
    }

    fn handle_vm(
        state: &mut FakeState,
        method: HttpMethod,
        node: &str,
        vmid: u32,
        rest: &[&str],
        body: Value,
    ) -> ApiResponse {
        let Some(vm) = state.vms.get(&vmid) else {
            return fail(500, "vm does not exist");
        };
        if vm.node != node {
            return fail(500, "vm lives on another node");
        }

        match (method, rest) {
            (HttpMethod::Post, ["clone"]) => {
                let newid = body["newid"].as_u64().unwrap_or_default() as u32;
                if state.vms.contains_key(&newid) {
                    return fail(500, "vmid already in use");
                }
                let name = body["name"].as_str().unwrap_or_default().to_string();
                let target = body["target"].as_str().unwrap_or(node).to_string();
                let pool = body["pool"].as_str().map(str::to_string);
                let mut config = vm.config.clone();
                config.insert("name".into(), json!(name));
                let stuck = state.stuck_clones.contains(&name);
                let clone = FakeVm {
                    vmid: newid,
                    node: target,
                    name: name.clone(),
                    pool,
                    template: false,
                    status: "stopped".to_string(),
                    maxmem: vm.maxmem,
                    config,
                    lock_reads_left: if stuck { u32::MAX } else { state.clone_lock_reads },
                    disk_ready: true,
                    status_script: state.clone_scripts.get(&name).cloned().unwrap_or_default().into(),
                    scripted_lock: false,
                };
                state.vms.insert(newid, clone);
                ok(json!(format!("UPID:{}:qmclone:{}", node, newid)))
            }
            (HttpMethod::Get, ["status", "current"]) => {
                let vm = state.vms.get_mut(&vmid).expect("vm present");
                let next = if vm.status_script.len() > 1 {
                    vm.status_script.pop_front()
                } else {
                    vm.status_script.front().cloned()
                };
                if let Some((status, locked)) = next {
                    vm.status = status;
                    vm.scripted_lock = locked;
                }
                ok(json!({ "status": vm.status }))
            }
            (HttpMethod::Get, ["config"]) => {
                let mut config = vm.config.clone();
                let vm = state.vms.get_mut(&vmid).expect("vm present");
                if vm.scripted_lock {
                    config.insert("lock".into(), json!("clone"));
                } else if vm.lock_reads_left > 0 {
                    vm.lock_reads_left = vm.lock_reads_left.saturating_sub(1);
                    config.insert("lock".into(), json!("clone"));
                }
                ok(Value::Object(config))
            }
            (HttpMethod::Put, ["config"]) => {
                let vm = state.vms.get_mut(&vmid).expect("vm present");
                if let Value::Object(changes) = body {
                    vm.config.extend(changes);
                }
                ok(Value::Null)
            }
            (HttpMethod::Post, ["status", "start"]) => {
                state.vms.get_mut(&vmid).expect("vm present").status = "running".to_string();
                ok(json!("UPID:start"))
            }
            (HttpMethod::Post, ["status", "stop"]) => {
                state.vms.get_mut(&vmid).expect("vm present").status = "stopped".to_string();
                ok(json!("UPID:stop"))
            }
            (HttpMethod::Delete, []) => {
                if vm.status == "running" {
                    return fail(500, "vm is running");
                }
                state.vms.remove(&vmid);
                ok(json!("UPID:destroy"))
            }
            (HttpMethod::Post, ["agent", "ping"]) => {
                if vm.status == "running" {
                    ok(Value::Null)
                } else {
                    fail(500, "guest agent not running")
                }
            }
            (HttpMethod::Post, ["agent", "exec"]) => {
                let command: Vec<String> = body["command"]
                    .as_array()
                    .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                    .unwrap_or_default();
                state.execs.push((vmid, command));
                ok(json!({ "pid": 42 }))
            }
            _ => fail(501, "not implemented by fake"),
        }
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn request(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<&Value>,
    ) -> KaminoResult<ApiResponse> {
        tokio::task::yield_now().await;
        Ok(self.handle(method, path, body))
    }
}

/// Settings with millisecond polling so timeouts trip quickly.
pub fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.proxmox.host = "pve.test".to_string();
    settings.proxmox.token_id = "kamino@pve!engine".to_string();
    settings.proxmox.token_secret = "secret".to_string();
    settings.proxmox.nodes = NODES.iter().map(|n| n.to_string()).collect();
    settings.proxmox.storage_id = STORAGE.to_string();
    settings.polling.initial_interval_ms = 1;
    settings.polling.max_interval_ms = 4;
    settings.polling.disk_interval_ms = 1;
    settings.polling.clone_timeout_ms = 2_000;
    settings.polling.disk_timeout_ms = 2_000;
    settings.polling.agent_timeout_ms = 2_000;
    settings.polling.pool_empty_timeout_ms = 2_000;
    settings.lock.max_attempts = 1_000;
    settings.lock.initial_backoff_ms = 1;
    settings.lock.acquire_timeout_ms = 20_000;
    settings
}

pub fn lock_for(settings: &Settings) -> Arc<DistributedLock> {
    Arc::new(DistributedLock::new(
        Arc::new(MemoryLockStore::new()),
        settings.lock.policy(),
    ))
}

pub fn manager_with(cluster: Arc<FakeCluster>, settings: Settings) -> PodManager {
    let lock = lock_for(&settings);
    PodManager::new(
        cluster,
        lock,
        Arc::new(InMemoryTemplateRegistry::new()),
        Arc::new(settings),
    )
}

pub fn manager(cluster: Arc<FakeCluster>) -> PodManager {
    manager_with(cluster, fast_settings())
}
