/*
* Kamino Configuration
* --------------------
*
* Layered configuration, lowest to highest priority:
*
* 1. Hardcoded defaults (Default impls below + set_default)
* 2. <CONFIG_PATH>/default.toml
* 3. <CONFIG_PATH>/local.toml
* 4. Environment variables, prefix KAMINO, sections split by "__"
*    e.g. KAMINO_PROXMOX__TOKEN_SECRET, KAMINO_PROXMOX__NODES=pve1,pve2
*
* Sections:
* ---------
* server        - where the API listens
* proxmox       - cluster endpoint, API token, TLS policy, compute node list
* lock          - shared cache for the vmid allocation lock
* provisioning  - template/router naming, SDN zone, ACL roles
* polling       - backoff and timeout budgets for every wait loop
* router        - guest agent commands run inside the pod router
* auth          - session token signing
* rate_limits   - API request quotas
* jobs          - how long finished job records are kept
*
* Settings are loaded once and handed around behind an Arc. Nothing in the
* crate reads the environment after startup.
*/

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use crate::core::poll::PollPolicy;
use crate::errors::{KaminoError, KaminoResult};
use crate::lock::LockPolicy;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub proxmox: ProxmoxSettings,
    pub lock: LockSettings,
    pub provisioning: ProvisioningSettings,
    pub polling: PollingSettings,
    pub router: RouterSettings,
    pub auth: AuthSettings,
    pub rate_limits: RateLimitSettings,
    pub jobs: JobSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub api_prefix: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            api_prefix: "/api/v1".to_string(),
        }
    }
}

/// Connection details for the hypervisor cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxmoxSettings {
    pub host: String,
    pub port: u16,
    /// API token id, `user@realm!tokenname`.
    pub token_id: String,
    pub token_secret: String,
    pub verify_tls: bool,
    /// Compute nodes eligible for clone placement, in evaluation order.
    pub nodes: Vec<String>,
    /// Storage polled for clone disks and reported by /resources.
    pub storage_id: String,
    /// Realm appended to usernames when granting pool ACLs.
    pub user_realm: String,
    pub request_timeout_secs: u64,
}

impl Default for ProxmoxSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 8006,
            token_id: String::new(),
            token_secret: String::new(),
            verify_tls: true,
            nodes: Vec::new(),
            storage_id: "local-lvm".to_string(),
            user_realm: "SDC".to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl ProxmoxSettings {
    pub fn base_url(&self) -> String {
        format!("https://{}:{}/api2/json", self.host, self.port)
    }

    pub fn auth_header(&self) -> String {
        format!("PVEAPIToken={}={}", self.token_id, self.token_secret)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    /// `redis://[:password@]host:port/db`. Empty keeps locks in-process.
    pub redis_url: String,
    pub ttl_ms: u64,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub acquire_timeout_ms: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            redis_url: String::new(),
            ttl_ms: 30_000,
            max_attempts: 7,
            initial_backoff_ms: 250,
            acquire_timeout_ms: 20_000,
        }
    }
}

impl LockSettings {
    pub fn policy(&self) -> LockPolicy {
        LockPolicy {
            ttl: Duration::from_millis(self.ttl_ms),
            max_attempts: self.max_attempts.max(1),
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningSettings {
    pub template_pool_prefix: String,
    /// Name of the NAT router VM cloned into every pod.
    pub router_template: String,
    /// Staging pool the router template lives in.
    pub router_pool: String,
    pub sdn_zone: String,
    pub vlan_base: u16,
    pub pod_roles: Vec<String>,
}

impl Default for ProvisioningSettings {
    fn default() -> Self {
        Self {
            template_pool_prefix: "kamino_template_".to_string(),
            router_template: "kamino-router".to_string(),
            router_pool: "kamino_router".to_string(),
            sdn_zone: "kamino".to_string(),
            vlan_base: 1800,
            pod_roles: vec!["PVEVMUser".to_string(), "PVEPoolUser".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSettings {
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    pub clone_timeout_ms: u64,
    pub disk_interval_ms: u64,
    pub disk_timeout_ms: u64,
    pub agent_timeout_ms: u64,
    pub pool_empty_timeout_ms: u64,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            initial_interval_ms: 1_000,
            max_interval_ms: 30_000,
            clone_timeout_ms: 300_000,
            disk_interval_ms: 5_000,
            disk_timeout_ms: 300_000,
            agent_timeout_ms: 300_000,
            pool_empty_timeout_ms: 300_000,
        }
    }
}

impl PollingSettings {
    fn backoff(&self, timeout_ms: u64) -> PollPolicy {
        PollPolicy::exponential(
            Duration::from_millis(self.initial_interval_ms),
            Duration::from_millis(self.max_interval_ms),
            Duration::from_millis(timeout_ms),
        )
    }

    pub fn clone_policy(&self) -> PollPolicy {
        self.backoff(self.clone_timeout_ms)
    }

    pub fn agent_policy(&self) -> PollPolicy {
        self.backoff(self.agent_timeout_ms)
    }

    pub fn pool_empty_policy(&self) -> PollPolicy {
        self.backoff(self.pool_empty_timeout_ms)
    }

    pub fn disk_policy(&self) -> PollPolicy {
        PollPolicy::fixed(
            Duration::from_millis(self.disk_interval_ms),
            Duration::from_millis(self.disk_timeout_ms),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterSettings {
    /// argv run through the guest agent; the WAN address is appended.
    pub wan_command: Vec<String>,
    /// argv run through the guest agent; the VIP subnet is appended.
    pub vip_command: Vec<String>,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            wan_command: vec!["/usr/local/sbin/kamino-set-wan".to_string()],
            vip_command: vec!["/usr/local/sbin/kamino-set-vip".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub jwt_secret: String,
    pub token_ttl_secs: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            token_ttl_secs: 8 * 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub api_requests_per_minute: u32,
    pub mutation_requests_per_minute: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            api_requests_per_minute: 600,
            mutation_requests_per_minute: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSettings {
    /// Finished records older than this are dropped.
    pub retention_secs: u64,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            retention_secs: 24 * 3600,
        }
    }
}

impl JobSettings {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = std::env::var("CONFIG_PATH")
            .unwrap_or_else(|_| "config".to_string());

        info!("Loading configuration from path: {}", config_path);

        Self::load(&config_path)
    }

    pub fn load(config_path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 3000)?
            .set_default("server.api_prefix", "/api/v1")?
            .add_source(File::with_name(&format!("{}/default", config_path)).required(false))
            .add_source(File::with_name(&format!("{}/local", config_path)).required(false))
            .add_source(
                Environment::with_prefix("KAMINO")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("proxmox.nodes")
                    .with_list_parse_key("provisioning.pod_roles")
                    .with_list_parse_key("router.wan_command")
                    .with_list_parse_key("router.vip_command")
                    .try_parsing(true),
            )
            .build()?;

        let mut settings: Settings = config.try_deserialize()?;
        settings.normalize();
        Ok(settings)
    }

    /// `KAMINO_PROXMOX__NODES=pve1,` yields a blank trailing entry; drop it.
    fn normalize(&mut self) {
        self.proxmox.nodes = self
            .proxmox
            .nodes
            .iter()
            .map(|n| n.trim())
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .collect();
    }

    /// Checks the values every cluster operation needs.
    pub fn validate(&self) -> KaminoResult<()> {
        let mut missing = Vec::new();
        if self.proxmox.host.trim().is_empty() {
            missing.push("proxmox.host");
        }
        if self.proxmox.token_id.trim().is_empty() {
            missing.push("proxmox.token_id");
        }
        if self.proxmox.token_secret.trim().is_empty() {
            missing.push("proxmox.token_secret");
        }
        if self.proxmox.nodes.is_empty() || self.proxmox.nodes.iter().any(|n| n.trim().is_empty()) {
            missing.push("proxmox.nodes");
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(KaminoError::Config(format!(
                "missing required settings: {}",
                missing.join(", ")
            )))
        }
    }

    /// Cluster checks plus what the HTTP server needs to authenticate callers.
    pub fn validate_for_serving(&self) -> KaminoResult<()> {
        self.validate()?;
        if self.auth.jwt_secret.len() < 16 {
            return Err(KaminoError::Config(
                "auth.jwt_secret must be at least 16 characters".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn generate_default_config() -> Settings {
    Settings {
        proxmox: ProxmoxSettings {
            host: "pve.example.internal".to_string(),
            nodes: vec!["pve1".to_string(), "pve2".to_string()],
            ..Default::default()
        },
        lock: LockSettings {
            redis_url: "redis://127.0.0.1:6379/0".to_string(),
            ..Default::default()
        },
        ..Default::default()
    }
}
