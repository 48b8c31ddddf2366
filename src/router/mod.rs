use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::RouterSettings;
use crate::core::poll::{poll_until, PollPolicy};
use crate::core::proxmox::{ClusterApi, HttpMethod};
use crate::core::vm::VmRef;
use crate::errors::{KaminoError, KaminoResult};

pub fn wan_address(pod_number: u16) -> String {
    format!("172.16.{}.1", pod_number)
}

pub fn vip_subnet(pod_number: u16) -> String {
    format!("172.16.{}.0", pod_number)
}

/// Sets pod-specific addressing inside a running router through the guest
/// agent. Nothing here rolls the pod back; callers record the error.
pub struct RouterConfigurator<'a> {
    api: &'a dyn ClusterApi,
    settings: &'a RouterSettings,
    agent_policy: PollPolicy,
}

impl<'a> RouterConfigurator<'a> {
    pub fn new(api: &'a dyn ClusterApi, settings: &'a RouterSettings, agent_policy: PollPolicy) -> Self {
        Self {
            api,
            settings,
            agent_policy,
        }
    }

    pub async fn configure(&self, router: &VmRef, pod_number: u16) -> KaminoResult<()> {
        self.wait_for_agent(router).await?;

        let wan = wan_address(pod_number);
        self.exec(router, &self.settings.wan_command, &wan)
            .await
            .map_err(|e| annotate(e, "setting router WAN address"))?;

        let vip = vip_subnet(pod_number);
        self.exec(router, &self.settings.vip_command, &vip)
            .await
            .map_err(|e| annotate(e, "setting router VIP subnet"))?;

        info!(vmid = router.vmid, wan = %wan, vip = %vip, "Router configured");
        Ok(())
    }

    async fn wait_for_agent(&self, router: &VmRef) -> KaminoResult<()> {
        let api = self.api;
        let path = router.path("agent/ping");
        poll_until(
            self.agent_policy,
            &format!("guest agent on vm {}", router.vmid),
            || {
                let path = path.clone();
                async move {
                    let response = api.request(HttpMethod::Post, &path, None).await?;
                    Ok(response.is_success().then_some(()))
                }
            },
        )
        .await
    }

    async fn exec(&self, router: &VmRef, argv: &[String], address: &str) -> KaminoResult<()> {
        if argv.is_empty() {
            return Err(KaminoError::Config("router command is empty".to_string()));
        }
        let mut command: Vec<Value> = argv.iter().map(|a| Value::String(a.clone())).collect();
        command.push(Value::String(address.to_string()));

        let path = router.path("agent/exec");
        let response = self
            .api
            .request(HttpMethod::Post, &path, Some(&json!({ "command": command })))
            .await?;
        if !response.is_success() {
            warn!(vmid = router.vmid, status = response.status, "guest exec rejected");
            return Err(KaminoError::Remote {
                status: response.status,
                path,
                message: response.body.trim().to_string(),
            });
        }
        Ok(())
    }
}

fn annotate(err: KaminoError, step: &str) -> KaminoError {
    match err {
        KaminoError::Remote { status, path, message } => KaminoError::Remote {
            status,
            path,
            message: format!("{}: {}", step, message),
        },
        other => other,
    }
}
