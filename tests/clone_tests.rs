mod common;

use common::{fast_settings, lock_for, FakeCluster, NODES};
use kamino_pod_manager::cluster::{list_vms, vm_config};
use kamino_pod_manager::core::clone::{CloneOperation, CloneState, Cloner};
use kamino_pod_manager::core::poll::PollPolicy;
use kamino_pod_manager::core::proxmox::HttpMethod;
use kamino_pod_manager::core::vm::VirtualResource;
use kamino_pod_manager::scheduler::select_best_node;
use kamino_pod_manager::KaminoError;
use std::time::Duration;

fn nodes() -> Vec<String> {
    NODES.iter().map(|n| n.to_string()).collect()
}

async fn template(cluster: &FakeCluster, name: &str) -> VirtualResource {
    list_vms(cluster)
        .await
        .unwrap()
        .into_iter()
        .find(|vm| vm.display_name() == name)
        .unwrap()
}

#[tokio::test]
async fn clone_is_verified_only_after_the_lock_clears() {
    let cluster = FakeCluster::with_web_template();
    cluster.state().clone_lock_reads = 3;
    let settings = fast_settings();
    let lock = lock_for(&settings);
    let nodes = nodes();
    let cloner = Cloner::new(cluster.as_ref(), &lock, &nodes, settings.polling.clone_policy());

    let source = template(&cluster, "web-01").await;
    let mut op = CloneOperation::new(source, "web-01", "1001_web_alice");
    let vm = cloner.run(&mut op).await.unwrap();

    assert_eq!(op.state(), CloneState::Verified);
    assert_eq!(op.vmid, Some(vm.vmid));
    let config_reads = cluster.calls_matching(HttpMethod::Get, &format!("qemu/{}/config", vm.vmid));
    assert!(config_reads.len() >= 4, "lock was reported three times, got {:?}", config_reads);

    let config = vm_config(cluster.as_ref(), &vm.node, vm.vmid).await.unwrap();
    assert_eq!(config.lock(), None);
}

#[tokio::test]
async fn pending_then_locked_clone_is_verified_at_the_unlocked_read() {
    let cluster = FakeCluster::with_web_template();
    cluster.script_clone(
        "web-01",
        &[("pending", false), ("running", true), ("running", true), ("running", false)],
    );
    let settings = fast_settings();
    let lock = lock_for(&settings);
    let nodes = nodes();
    let cloner = Cloner::new(cluster.as_ref(), &lock, &nodes, settings.polling.clone_policy());

    let source = template(&cluster, "web-01").await;
    let mut op = CloneOperation::new(source, "web-01", "1001_web_alice");
    let vm = cloner.run(&mut op).await.unwrap();
    assert_eq!(op.state(), CloneState::Verified);

    // One status read per step, and the config is only consulted once the
    // VM has settled.
    let status_reads = cluster.calls_matching(HttpMethod::Get, &format!("qemu/{}/status/current", vm.vmid));
    let config_reads = cluster.calls_matching(HttpMethod::Get, &format!("qemu/{}/config", vm.vmid));
    assert_eq!(status_reads.len(), 4);
    assert_eq!(config_reads.len(), 3);
    assert_eq!(cluster.state().vms[&vm.vmid].status, "running");
}

#[tokio::test]
async fn clone_that_never_settles_times_out_and_is_destroyed() {
    let cluster = FakeCluster::with_web_template();
    cluster.script_clone("db-01", &[("pending", false)]);
    let settings = fast_settings();
    let lock = lock_for(&settings);
    let nodes = nodes();
    let policy = PollPolicy::exponential(
        Duration::from_millis(1),
        Duration::from_millis(5),
        Duration::from_millis(100),
    );
    let cloner = Cloner::new(cluster.as_ref(), &lock, &nodes, policy);

    let source = template(&cluster, "db-01").await;
    let mut op = CloneOperation::new(source, "db-01", "1001_web_alice");
    let err = cloner.run(&mut op).await.unwrap_err();

    assert!(matches!(err, KaminoError::Timeout { cleanup: None, .. }), "{:?}", err);
    assert_eq!(op.state(), CloneState::TimedOut);
    let vmid = op.vmid.unwrap();
    assert!(cluster
        .calls_matching(HttpMethod::Get, &format!("qemu/{}/config", vmid))
        .is_empty());

    let calls = cluster.state().calls.clone();
    let stop = calls
        .iter()
        .position(|(m, p)| *m == HttpMethod::Post && p.ends_with(&format!("{}/status/stop", vmid)))
        .unwrap();
    let delete = calls
        .iter()
        .position(|(m, p)| *m == HttpMethod::Delete && p.ends_with(&format!("qemu/{}", vmid)))
        .unwrap();
    assert!(stop < delete);
    assert!(!cluster.state().vms.contains_key(&vmid));
}

#[tokio::test]
async fn returned_node_is_the_clone_target() {
    let cluster = FakeCluster::with_web_template();
    // Source templates live on pve1; make pve2 the obvious choice.
    cluster.state().nodes.get_mut("pve1").unwrap().cpu = 0.95;
    let settings = fast_settings();
    let lock = lock_for(&settings);
    let nodes = nodes();
    let cloner = Cloner::new(cluster.as_ref(), &lock, &nodes, settings.polling.clone_policy());

    let source = template(&cluster, "db-01").await;
    let mut op = CloneOperation::new(source, "db-01", "1001_web_alice");
    let vm = cloner.run(&mut op).await.unwrap();

    assert_eq!(vm.node, "pve2");
    assert_eq!(cluster.state().vms[&vm.vmid].node, "pve2");
    // Submitted against the source node, polled against the target.
    assert_eq!(cluster.calls_matching(HttpMethod::Post, "nodes/pve1/qemu/101/clone").len(), 1);
    assert!(!cluster
        .calls_matching(HttpMethod::Get, &format!("nodes/pve2/qemu/{}/status", vm.vmid))
        .is_empty());
}

#[tokio::test]
async fn stuck_clone_times_out_and_is_destroyed() {
    let cluster = FakeCluster::with_web_template();
    cluster.state().stuck_clones.insert("web-01".to_string());
    let settings = fast_settings();
    let lock = lock_for(&settings);
    let nodes = nodes();
    let policy = PollPolicy::exponential(
        Duration::from_millis(1),
        Duration::from_millis(5),
        Duration::from_millis(100),
    );
    let cloner = Cloner::new(cluster.as_ref(), &lock, &nodes, policy);

    let source = template(&cluster, "web-01").await;
    let mut op = CloneOperation::new(source, "web-01", "1001_web_alice");
    let err = cloner.run(&mut op).await.unwrap_err();

    assert!(matches!(err, KaminoError::Timeout { cleanup: None, .. }), "{:?}", err);
    assert_eq!(op.state(), CloneState::TimedOut);
    let vmid = op.vmid.unwrap();
    assert!(!cluster.state().vms.contains_key(&vmid));
    assert_eq!(cluster.calls_matching(HttpMethod::Post, &format!("{}/status/stop", vmid)).len(), 1);
}

#[tokio::test]
async fn failed_cleanup_is_reported_with_the_timeout() {
    let cluster = FakeCluster::with_web_template();
    cluster.state().stuck_clones.insert("web-01".to_string());
    let settings = fast_settings();
    let lock = lock_for(&settings);
    let nodes = nodes();
    let policy = PollPolicy::fixed(Duration::from_millis(2), Duration::from_millis(40));
    let cloner = Cloner::new(cluster.as_ref(), &lock, &nodes, policy);

    let source = template(&cluster, "web-01").await;
    let mut op = CloneOperation::new(source, "web-01", "1001_web_alice");
    // The clone lands on vmid 102, the first free id after the templates.
    cluster.fail(HttpMethod::Delete, "qemu/102", 500);
    let err = cloner.run(&mut op).await.unwrap_err();

    match err {
        KaminoError::Timeout { cleanup: Some(cleanup), .. } => assert!(cleanup.contains("102")),
        other => panic!("expected timeout with cleanup failure, got {:?}", other),
    }
}

#[tokio::test]
async fn scheduler_prefers_the_idle_node() {
    let cluster = FakeCluster::with_web_template();
    assert_eq!(select_best_node(cluster.as_ref(), &nodes()).await.unwrap(), "pve1");

    cluster.state().nodes.get_mut("pve1").unwrap().mem_used = 60 << 30;
    assert_eq!(select_best_node(cluster.as_ref(), &nodes()).await.unwrap(), "pve2");
}

#[tokio::test]
async fn scheduler_does_not_skip_unreachable_nodes() {
    let cluster = FakeCluster::with_web_template();
    cluster.state().nodes.get_mut("pve2").unwrap().failing = true;
    let err = select_best_node(cluster.as_ref(), &nodes()).await.unwrap_err();
    assert!(matches!(err, KaminoError::Remote { status: 500, .. }));
}
