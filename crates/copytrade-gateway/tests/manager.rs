//! Gateway manager lifecycle tests against mock collaborators.

use std::sync::Arc;
use std::time::Duration;

use copytrade_gateway::{
    BrokerClient,
    ContainerStatus, FollowerState, GatewayError, GatewayEvent, GatewayStatus, HealthState,
    ResourceKind,
};
use copytrade_test::{
    MockBrokerConnector, MockContainerRuntime, MockVault, TestHarness, follower, gateway_labels,
    test_config, test_credentials, vault_follower, vault_ref,
};

async fn wait_for_status(harness: &TestHarness, follower_id: &str, want: GatewayStatus) -> bool {
    for _ in 0..100 {
        if harness.manager.get_gateway_status(follower_id).await == Some(want) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn fourth_launch_exhausts_three_port_range() {
    let mut config = test_config();
    config.pools.port_end = 4102;
    let harness = TestHarness::new(
        config,
        [follower("f1"), follower("f2"), follower("f3"), follower("f4")],
    );

    for id in ["f1", "f2", "f3"] {
        harness.manager.launch_gateway(id).await.unwrap();
    }
    let err = harness.manager.launch_gateway("f4").await.unwrap_err();
    assert!(matches!(
        err,
        GatewayError::ResourceExhausted {
            resource: ResourceKind::Port,
            range_start: 4100,
            range_end: 4102,
        }
    ));

    let usage = harness.manager.pool_usage().await;
    assert_eq!(usage.ports, vec![4100, 4101, 4102]);
    assert_eq!(usage.client_ids, vec![1, 2, 3]);
    assert!(harness.manager.get_gateway_status("f4").await.is_none());
}

#[tokio::test]
async fn start_launches_only_enabled_followers() {
    let harness = TestHarness::new(
        test_config(),
        [
            follower("alice"),
            follower("bob"),
            follower("carol").with_enabled(false),
        ],
    );

    let report = harness.manager.start().await.unwrap();
    assert_eq!(report.started, vec!["alice", "bob"]);
    assert!(report.failed.is_empty());

    let gateways = harness.manager.list_gateways().await;
    assert_eq!(gateways.len(), 2);
    assert!(!gateways.contains_key("carol"));
    assert!(gateways.values().all(|g| g.status == GatewayStatus::Starting));

    harness.manager.stop().await;
}

#[tokio::test]
async fn disabling_a_follower_frees_its_resources() {
    let harness = TestHarness::new(test_config(), [follower("alice"), follower("bob")]);
    harness.manager.start().await.unwrap();

    let bob = harness.manager.list_gateways().await["bob"].clone();
    assert!(harness.store.set_enabled("bob", false).await);

    let report = harness.manager.reload_followers().await.unwrap();
    assert_eq!(report.stopped, vec!["bob"]);
    assert!(report.started.is_empty());

    let gateways = harness.manager.list_gateways().await;
    assert!(!gateways.contains_key("bob"));
    let usage = harness.manager.pool_usage().await;
    assert!(!usage.ports.contains(&bob.host_port));
    assert!(!usage.client_ids.contains(&bob.client_id));

    let container = harness.runtime.container(&harness.container_name("bob")).unwrap();
    assert!(container.is_removed());

    // The freed port and client id are handed out again.
    harness.store.upsert(follower("dave")).await;
    let dave = harness.manager.launch_gateway("dave").await.unwrap();
    assert_eq!(dave.host_port, bob.host_port);
    assert_eq!(dave.client_id, bob.client_id);

    harness.manager.stop().await;
}

#[tokio::test]
async fn get_client_reconnects_once_when_session_dropped() {
    let harness = TestHarness::new(test_config(), [follower("alice")]);
    harness.manager.start().await.unwrap();
    harness.manager.run_health_sweep().await;
    assert_eq!(
        harness.manager.get_gateway_status("alice").await,
        Some(GatewayStatus::Running)
    );

    let port = harness.manager.list_gateways().await["alice"].host_port;
    harness.broker.latest_client(port).unwrap().drop_connection();
    harness.broker.reset_attempts();

    let client = harness.manager.get_client("alice").await.unwrap();
    assert!(client.is_connected());
    assert_eq!(harness.broker.attempts(), 1);

    // Healthy session is served from cache.
    harness.manager.get_client("alice").await.unwrap();
    assert_eq!(harness.broker.attempts(), 1);

    harness.manager.stop().await;
}

#[tokio::test]
async fn get_client_returns_none_when_reconnect_fails() {
    let harness = TestHarness::new(test_config(), [follower("alice")]);
    harness.manager.start().await.unwrap();
    harness.manager.run_health_sweep().await;

    let port = harness.manager.list_gateways().await["alice"].host_port;
    harness.broker.latest_client(port).unwrap().drop_connection();
    harness.broker.set_refuse_all(true);
    harness.broker.reset_attempts();

    assert!(harness.manager.get_client("alice").await.is_none());
    assert_eq!(harness.broker.attempts(), 1);
    assert_eq!(
        harness.manager.get_gateway_status("alice").await,
        Some(GatewayStatus::Error)
    );
    assert!(harness.manager.get_client("nobody").await.is_none());

    harness.manager.stop().await;
}

#[tokio::test]
async fn get_client_discards_session_dead_on_arrival() {
    let harness = TestHarness::new(test_config(), [follower("alice")]);
    harness.manager.start().await.unwrap();
    harness.manager.run_health_sweep().await;

    let port = harness.manager.list_gateways().await["alice"].host_port;
    harness.broker.latest_client(port).unwrap().drop_connection();
    harness.broker.set_dead_on_arrival(true);

    assert!(harness.manager.get_client("alice").await.is_none());
    let summary = harness.manager.list_gateways().await["alice"].clone();
    assert_eq!(summary.status, GatewayStatus::Error);
    assert!(!summary.connected);
    assert!(summary.last_error.unwrap().contains("dropped"));

    let dead = harness.broker.latest_client(port).unwrap();
    assert_eq!(dead.disconnect_count(), 1);

    harness.manager.stop().await;
    assert_eq!(dead.disconnect_count(), 1);
}

#[tokio::test]
async fn stop_tears_down_everything() {
    let harness = TestHarness::new(
        test_config(),
        [follower("a"), follower("b"), follower("c")],
    );
    harness.manager.start().await.unwrap();
    harness.manager.run_health_sweep().await;
    assert_eq!(harness.manager.list_gateways().await.len(), 3);

    harness.manager.stop().await;

    assert!(harness.manager.list_gateways().await.is_empty());
    let usage = harness.manager.pool_usage().await;
    assert!(usage.ports.is_empty());
    assert!(usage.client_ids.is_empty());
    assert!(harness.runtime.live_containers().is_empty());
    assert!(
        harness
            .broker
            .clients()
            .iter()
            .all(|c| !c.is_connected() && c.disconnect_count() == 1)
    );

    // Second stop is a no-op; new work is refused.
    harness.manager.stop().await;
    assert!(matches!(
        harness.manager.start().await,
        Err(GatewayError::ShuttingDown)
    ));
    assert!(matches!(
        harness.manager.launch_gateway("a").await,
        Err(GatewayError::ShuttingDown)
    ));
}

#[tokio::test]
async fn stop_waits_for_in_flight_launch() {
    let vault = MockVault::new()
        .with_secret(vault_ref("slow"), test_credentials("slow"))
        .with_delay(Duration::from_millis(200));
    let harness = TestHarness::with_mocks(
        test_config(),
        [vault_follower("slow")],
        MockContainerRuntime::new(),
        MockBrokerConnector::new(),
        vault,
    );

    let manager = Arc::clone(&harness.manager);
    let launch = tokio::spawn(async move { manager.launch_gateway("slow").await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    harness.manager.stop().await;

    // Whichever way the launch ended, nothing outlives the shutdown.
    let _ = launch.await.unwrap();
    assert!(harness.manager.list_gateways().await.is_empty());
    let usage = harness.manager.pool_usage().await;
    assert!(usage.ports.is_empty());
    assert!(usage.client_ids.is_empty());
    assert!(harness.runtime.live_containers().is_empty());
}

#[tokio::test]
async fn launch_after_stop_creates_nothing() {
    let harness = TestHarness::new(test_config(), [follower("alice")]);
    harness.manager.stop().await;

    assert!(matches!(
        harness.manager.launch_gateway("alice").await,
        Err(GatewayError::ShuttingDown)
    ));
    assert!(matches!(
        harness.manager.reload_followers().await,
        Err(GatewayError::ShuttingDown)
    ));
    assert_eq!(harness.runtime.run_count(), 0);
    assert!(harness.manager.pool_usage().await.ports.is_empty());
}

#[tokio::test]
async fn concurrent_launches_of_one_follower_create_one_gateway() {
    let vault = MockVault::new()
        .with_secret(vault_ref("alice"), test_credentials("alice"))
        .with_delay(Duration::from_millis(30));
    let harness = TestHarness::with_mocks(
        test_config(),
        [vault_follower("alice")],
        MockContainerRuntime::new(),
        MockBrokerConnector::new(),
        vault,
    );

    let (first, second) = tokio::join!(
        harness.manager.launch_gateway("alice"),
        harness.manager.launch_gateway("alice"),
    );
    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(GatewayError::AlreadyRunning(_))))
            .count(),
        1
    );
    assert_eq!(harness.runtime.run_count(), 1);
    assert_eq!(harness.vault.calls(), 1);
    assert_eq!(harness.manager.pool_usage().await.ports.len(), 1);

    harness.manager.stop().await;
}

#[tokio::test]
async fn launch_racing_reload_creates_one_gateway() {
    let vault = MockVault::new()
        .with_secret(vault_ref("alice"), test_credentials("alice"))
        .with_delay(Duration::from_millis(30));
    let harness = TestHarness::with_mocks(
        test_config(),
        [vault_follower("alice")],
        MockContainerRuntime::new(),
        MockBrokerConnector::new(),
        vault,
    );

    let (launched, report) = tokio::join!(
        harness.manager.launch_gateway("alice"),
        harness.manager.reload_followers(),
    );
    let report = report.unwrap();
    assert!(report.failed.is_empty());
    match launched {
        Ok(_) => assert!(report.started.is_empty()),
        Err(GatewayError::AlreadyRunning(_)) => assert_eq!(report.started, vec!["alice"]),
        Err(e) => panic!("unexpected launch error: {e}"),
    }
    assert_eq!(harness.runtime.run_count(), 1);
    assert_eq!(harness.manager.pool_usage().await.ports.len(), 1);
    assert_eq!(harness.manager.list_gateways().await.len(), 1);

    harness.manager.stop().await;
}

#[tokio::test]
async fn launch_gateway_checks_follower() {
    let harness = TestHarness::new(
        test_config(),
        [
            follower("active"),
            follower("off").with_enabled(false),
            follower("closed").with_state(FollowerState::Closed),
        ],
    );

    assert!(matches!(
        harness.manager.launch_gateway("ghost").await,
        Err(GatewayError::FollowerNotFound(_))
    ));
    assert!(matches!(
        harness.manager.launch_gateway("off").await,
        Err(GatewayError::FollowerNotEligible(_))
    ));
    assert!(matches!(
        harness.manager.launch_gateway("closed").await,
        Err(GatewayError::FollowerNotEligible(_))
    ));

    let summary = harness.manager.launch_gateway("active").await.unwrap();
    assert_eq!(summary.status, GatewayStatus::Starting);
    assert!(matches!(
        harness.manager.launch_gateway("active").await,
        Err(GatewayError::AlreadyRunning(_))
    ));
    assert_eq!(harness.manager.pool_usage().await.ports.len(), 1);

    harness.manager.stop().await;
}

#[tokio::test]
async fn container_env_carries_credentials_and_resources() {
    let vault = MockVault::new().with_secret(vault_ref("alice"), test_credentials("alice"));
    let harness = TestHarness::with_mocks(
        test_config(),
        [vault_follower("alice"), follower("bob")],
        MockContainerRuntime::new(),
        MockBrokerConnector::new(),
        vault,
    );
    harness.manager.start().await.unwrap();

    let alice = harness.runtime.container(&harness.container_name("alice")).unwrap();
    let env = &alice.spec().unwrap().env;
    assert_eq!(env["TWS_USERID"], "user-alice");
    assert_eq!(env["TWS_PASSWORD"], "pw-alice");
    assert_eq!(env["TRADING_MODE"], "paper");
    assert_eq!(env["FOLLOWER_ID"], "alice");
    let summary = harness.manager.list_gateways().await["alice"].clone();
    assert_eq!(env["GATEWAY_HOST_PORT"], summary.host_port.to_string());
    assert_eq!(env["IBKR_CLIENT_ID"], summary.client_id.to_string());
    assert_eq!(
        alice.spec().unwrap().ports.get(&4004u16),
        Some(&summary.host_port)
    );

    // Inline username: no password is injected.
    let bob = harness.runtime.container(&harness.container_name("bob")).unwrap();
    let env = &bob.spec().unwrap().env;
    assert_eq!(env["TWS_USERID"], "user-bob");
    assert!(!env.contains_key("TWS_PASSWORD"));

    harness.manager.stop().await;
}

#[tokio::test]
async fn existing_container_is_adopted() {
    let runtime = MockContainerRuntime::new();
    let existing = runtime.insert_existing_with_labels(
        "ibgw-alice",
        gateway_labels("alice", 4100, 1),
        ContainerStatus::Running,
    );
    let harness = TestHarness::with_mocks(
        test_config(),
        [follower("alice")],
        runtime,
        MockBrokerConnector::new(),
        MockVault::new(),
    );

    harness.manager.start().await.unwrap();
    assert_eq!(harness.runtime.run_count(), 0);
    let summary = harness.manager.list_gateways().await["alice"].clone();
    assert_eq!(summary.container_id, copytrade_gateway::ContainerHandle::id(existing.as_ref()));

    harness.manager.stop().await;
    assert!(existing.is_removed());
}

#[tokio::test]
async fn container_bound_to_other_resources_is_recreated() {
    let runtime = MockContainerRuntime::new();
    // Left over from a run where alice held port 4101 and client id 2.
    let stale = runtime.insert_existing_with_labels(
        "ibgw-alice",
        gateway_labels("alice", 4101, 2),
        ContainerStatus::Running,
    );
    let harness = TestHarness::with_mocks(
        test_config(),
        [follower("alice")],
        runtime,
        MockBrokerConnector::new(),
        MockVault::new(),
    );

    harness.manager.start().await.unwrap();
    assert!(stale.is_removed());
    assert_eq!(stale.forced_remove_count(), 1);
    assert_eq!(harness.runtime.run_count(), 1);

    let summary = harness.manager.list_gateways().await["alice"].clone();
    let fresh = harness.runtime.container("ibgw-alice").unwrap();
    assert_ne!(summary.container_id, copytrade_gateway::ContainerHandle::id(stale.as_ref()));
    assert_eq!(
        fresh.spec().unwrap().ports.get(&4004u16),
        Some(&summary.host_port)
    );
    assert_eq!(fresh.spec().unwrap().env["IBKR_CLIENT_ID"], summary.client_id.to_string());

    harness.manager.run_health_sweep().await;
    assert_eq!(
        harness.manager.get_gateway_status("alice").await,
        Some(GatewayStatus::Running)
    );
    assert_eq!(harness.broker.attempts_for(summary.host_port), 1);

    harness.manager.stop().await;
}

#[tokio::test]
async fn unlabelled_container_is_recreated() {
    let runtime = MockContainerRuntime::new();
    let foreign = runtime.insert_existing("ibgw-alice", ContainerStatus::Running);
    let harness = TestHarness::with_mocks(
        test_config(),
        [follower("alice")],
        runtime,
        MockBrokerConnector::new(),
        MockVault::new(),
    );

    harness.manager.start().await.unwrap();
    assert!(foreign.is_removed());
    assert_eq!(harness.runtime.run_count(), 1);

    harness.manager.stop().await;
}

#[tokio::test]
async fn vault_outage_abandons_launch_until_next_pass() {
    let harness = TestHarness::new(test_config(), [vault_follower("alice"), follower("bob")]);
    harness.vault.set_unavailable(true);
    let mut events = harness.manager.subscribe_events();

    let report = harness.manager.start().await.unwrap();
    assert_eq!(report.started, vec!["bob"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "alice");
    assert!(report.failed[0].1.contains("credential"));
    assert_eq!(harness.vault.calls(), 3);
    let bob_port = harness.manager.list_gateways().await["bob"].host_port;
    assert_eq!(harness.manager.pool_usage().await.ports, vec![bob_port]);

    let mut saw_unavailable = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, GatewayEvent::CredentialsUnavailable { ref follower_id, .. } if follower_id == "alice") {
            saw_unavailable = true;
        }
    }
    assert!(saw_unavailable);

    harness.vault.set_unavailable(false);
    harness.vault.insert(vault_ref("alice"), test_credentials("alice"));
    let report = harness.manager.reload_followers().await.unwrap();
    assert_eq!(report.started, vec!["alice"]);

    harness.manager.stop().await;
}

#[tokio::test]
async fn teardown_failure_still_releases_resources() {
    let harness = TestHarness::new(test_config(), [follower("alice")]);
    harness.manager.start().await.unwrap();

    let container = harness.runtime.container(&harness.container_name("alice")).unwrap();
    container.fail_stop("daemon busy");
    container.fail_forced_remove("daemon busy");

    let err = harness.manager.stop_follower_gateway("alice").await.unwrap_err();
    assert!(matches!(err, GatewayError::ContainerTeardownFailed { .. }));
    assert_eq!(container.stop_count(), 1);
    assert_eq!(container.forced_remove_count(), 1);

    assert!(harness.manager.list_gateways().await.is_empty());
    assert!(harness.manager.pool_usage().await.ports.is_empty());
    assert!(matches!(
        harness.manager.stop_follower_gateway("alice").await,
        Err(GatewayError::GatewayNotFound(_))
    ));

    harness.manager.stop().await;
}

#[tokio::test]
async fn graceful_failure_falls_back_to_forced_removal() {
    let harness = TestHarness::new(test_config(), [follower("alice")]);
    harness.manager.start().await.unwrap();

    let container = harness.runtime.container(&harness.container_name("alice")).unwrap();
    container.fail_remove("conflict");

    harness.manager.stop_follower_gateway("alice").await.unwrap();
    assert_eq!(container.remove_count(), 1);
    assert_eq!(container.forced_remove_count(), 1);
    assert!(container.is_removed());

    harness.manager.stop().await;
}

#[tokio::test]
async fn disconnect_errors_are_swallowed_on_stop() {
    let harness = TestHarness::with_mocks(
        test_config(),
        [follower("alice")],
        MockContainerRuntime::new(),
        MockBrokerConnector::new().with_failing_disconnect(),
        MockVault::new(),
    );
    harness.manager.start().await.unwrap();
    harness.manager.run_health_sweep().await;

    harness.manager.stop_follower_gateway("alice").await.unwrap();
    assert_eq!(harness.broker.clients()[0].disconnect_count(), 1);

    harness.manager.stop().await;
}

#[tokio::test]
async fn monitor_loop_promotes_gateways() {
    let mut config = test_config();
    config.timeouts.healthcheck_interval_ms = Some(20);
    let harness = TestHarness::new(config, [follower("alice"), follower("bob")]);

    harness.manager.start().await.unwrap();
    assert!(wait_for_status(&harness, "alice", GatewayStatus::Running).await);
    assert!(wait_for_status(&harness, "bob", GatewayStatus::Running).await);
    assert!(harness.manager.is_healthy("alice").await);

    tokio::time::timeout(Duration::from_secs(3), harness.manager.stop())
        .await
        .unwrap();
    assert!(harness.manager.list_gateways().await.is_empty());
}

#[tokio::test]
async fn connect_on_launch_brings_session_up_without_sweep() {
    let mut config = test_config();
    config.gateway.connect_on_launch = true;
    let harness = TestHarness::new(config, [follower("alice")]);

    harness.manager.start().await.unwrap();
    assert!(wait_for_status(&harness, "alice", GatewayStatus::Running).await);
    assert!(harness.manager.get_client("alice").await.is_some());

    harness.manager.stop().await;
}

#[tokio::test]
async fn reconnect_replaces_session() {
    let harness = TestHarness::new(test_config(), [follower("alice")]);
    harness.manager.start().await.unwrap();
    harness.manager.run_health_sweep().await;

    let port = harness.manager.list_gateways().await["alice"].host_port;
    let first = harness.broker.latest_client(port).unwrap();

    assert!(harness.manager.reconnect("alice").await);
    assert_eq!(first.disconnect_count(), 1);
    let second = harness.broker.latest_client(port).unwrap();
    assert!(second.is_connected());
    assert_eq!(harness.broker.clients().len(), 2);

    harness.broker.set_refuse_all(true);
    assert!(!harness.manager.reconnect("alice").await);
    assert_eq!(
        harness.manager.get_gateway_status("alice").await,
        Some(GatewayStatus::Error)
    );
    assert!(!harness.manager.reconnect("ghost").await);

    harness.manager.stop().await;
}

#[tokio::test]
async fn is_healthy_does_not_change_status() {
    let harness = TestHarness::new(test_config(), [follower("alice")]);
    harness.manager.start().await.unwrap();
    harness.manager.run_health_sweep().await;
    assert!(harness.manager.is_healthy("alice").await);

    harness
        .runtime
        .set_status(&harness.container_name("alice"), ContainerStatus::Exited);
    assert!(!harness.manager.is_healthy("alice").await);
    assert_eq!(
        harness.manager.get_gateway_status("alice").await,
        Some(GatewayStatus::Running)
    );
    assert!(!harness.manager.is_healthy("ghost").await);

    harness.manager.stop().await;
}

#[tokio::test]
async fn health_report_tracks_fleet() {
    let harness = TestHarness::new(test_config(), [follower("alice"), follower("bob")]);
    harness.manager.start().await.unwrap();
    assert_eq!(harness.manager.health_report().await.state, HealthState::Degraded);

    harness.manager.run_health_sweep().await;
    let report = harness.manager.health_report().await;
    assert_eq!(report.state, HealthState::Healthy);
    assert_eq!(report.checks.len(), 4);

    harness
        .runtime
        .set_status(&harness.container_name("bob"), ContainerStatus::Exited);
    harness.manager.run_health_sweep().await;

    let report = harness.manager.health_report().await;
    assert_eq!(report.state, HealthState::Unhealthy);
    assert_eq!(report.unhealthy_checks()[0].component, "gateway:bob");

    harness.manager.stop().await;
}

#[tokio::test]
async fn lifecycle_events_are_published() {
    let harness = TestHarness::new(test_config(), [follower("alice")]);
    let mut events = harness.manager.subscribe_events();

    harness.manager.start().await.unwrap();
    harness.manager.run_health_sweep().await;
    harness.manager.stop_follower_gateway("alice").await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.follower_id(), "alice");
        seen.push(event);
    }
    assert!(matches!(
        seen.first(),
        Some(GatewayEvent::Launched { host_port: 4100, client_id: 1, .. })
    ));
    assert!(seen.iter().any(|e| matches!(
        e,
        GatewayEvent::StatusChanged {
            to: GatewayStatus::Running,
            ..
        }
    )));
    assert!(matches!(seen.last(), Some(GatewayEvent::Stopped { .. })));

    harness.manager.stop().await;
}

#[tokio::test]
async fn stop_lets_launch_checks_finish() {
    let mut config = test_config();
    config.gateway.connect_on_launch = true;
    let harness = TestHarness::with_mocks(
        config,
        [follower("alice"), follower("bob")],
        MockContainerRuntime::new(),
        MockBrokerConnector::new().with_delay(Duration::from_millis(100)),
        MockVault::new(),
    );

    harness.manager.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    tokio::time::timeout(Duration::from_secs(2), harness.manager.stop())
        .await
        .unwrap();

    // Attempts in flight at shutdown ran to completion instead of being
    // aborted, and every session they produced was closed by teardown.
    assert_eq!(harness.broker.attempts(), 2);
    assert!(harness.broker.clients().iter().all(|c| !c.is_connected()));
    assert!(harness.manager.list_gateways().await.is_empty());
}
