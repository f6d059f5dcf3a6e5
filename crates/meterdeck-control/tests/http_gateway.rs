use meterdeck_control::{
    config::GatewayRoutes, gateway::Gateway, CommandRequest, ControlAction, ControlConfig,
    ControlCore, ControlError, HttpGateway, PollOutcome, Session, StatusTag, Verdict,
};
use meterdeck_core::Device;
use meterdeck_gateway_sim::{demo_devices, router, SimConfig, SimState};
use std::{sync::Arc, time::Duration};

async fn spawn_sim(state: SimState) -> (String, Arc<SimState>) {
    let state = Arc::new(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind simulator");
    let addr = listener.local_addr().expect("local addr");
    let app = router(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}/api/"), state)
}

fn locked() -> SimConfig {
    SimConfig {
        token: Some("s3cret".to_string()),
        actuation_delay: Duration::from_millis(300),
        ..SimConfig::default()
    }
}

fn config_for(base: &str, credential: Option<&str>) -> ControlConfig {
    ControlConfig {
        gateway_url: base.to_string(),
        credential: credential.map(str::to_string),
        ..ControlConfig::default()
    }
}

fn gateway_for(config: &ControlConfig) -> HttpGateway {
    HttpGateway::new(
        config,
        Arc::new(Session::new(config.credential.clone())),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn authorized_reads_narrow_into_typed_payloads() {
    let (base, _sim) = spawn_sim(SimState::demo(locked())).await;
    let gateway = gateway_for(&config_for(&base, Some("s3cret")));

    let devices = gateway.list_devices().await.expect("devices");
    assert_eq!(devices.len(), 3);
    assert_eq!(
        devices[0].outputs.as_ref().map(|outputs| outputs.len()),
        Some(2)
    );

    let records = gateway
        .device_status("MTR-001")
        .await
        .expect("status")
        .into_records()
        .expect("records");
    assert_eq!(records.len(), 2);
    assert_eq!(records["relay-1"].status, StatusTag::On);

    let outputs = gateway.device_outputs("MTR-002").await.expect("outputs");
    assert_eq!(outputs.len(), 1);

    let sample = gateway.telemetry("MTR-001").await.expect("telemetry");
    assert_eq!(sample.current_avg, Some(8.4));
    assert!(gateway.audit_log().await.expect("audit").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_credential_maps_to_unauthorized_and_tears_down() {
    let (base, _sim) = spawn_sim(SimState::demo(locked())).await;
    let core = ControlCore::connect(config_for(&base, Some("wrong")));

    let (status, audit) = tokio::join!(core.fetch_status("MTR-001"), core.refresh_audit_log());
    assert_eq!(status, Err(ControlError::Unauthorized));
    assert_eq!(audit, Err(ControlError::Unauthorized));
    assert_eq!(core.session().teardown_count(), 1);
    assert_eq!(core.session().credential(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_json_body_is_a_format_failure() {
    let (base, _sim) = spawn_sim(SimState::demo(SimConfig::default())).await;
    let root = base.trim_end_matches("api/").to_string();
    let config = ControlConfig {
        routes: GatewayRoutes {
            devices: "health".to_string(),
            ..GatewayRoutes::default()
        },
        ..config_for(&root, None)
    };
    let err = gateway_for(&config)
        .list_devices()
        .await
        .expect_err("text/plain body");
    assert!(matches!(err, ControlError::Format(_)), "{err:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_device_maps_to_unexpected_status() {
    let (base, _sim) = spawn_sim(SimState::demo(SimConfig::default())).await;
    let err = gateway_for(&config_for(&base, None))
        .device_status("MTR-404")
        .await
        .expect_err("404");
    assert_eq!(err, ControlError::UnexpectedStatus(404));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn device_ids_are_percent_encoded_in_paths() {
    let mut devices: Vec<Device> = demo_devices();
    devices[1].device_id = "pump 7/b".to_string();
    let (base, _sim) = spawn_sim(SimState::new(SimConfig::default(), devices)).await;
    let core = ControlCore::connect(config_for(&base, None));

    let outcome = core.fetch_status("pump 7/b").await.expect("status");
    assert!(matches!(outcome, PollOutcome::Committed(_)));
    assert_eq!(core.get_status("pump 7/b")["relay-1"].status, StatusTag::On);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn trip_is_verified_against_simulated_telemetry() {
    let (base, sim) = spawn_sim(SimState::demo(locked())).await;
    let mut config = config_for(&base, Some("s3cret"));
    config.verification.tick_ms = 100;
    config.verification.timeout_ms = 3_000;
    let core = ControlCore::connect(config);

    let request = CommandRequest::new("MTR-002", ControlAction::Trip, "relay-1")
        .with_output_key("relay-1")
        .with_reason("isolation test");
    let report = core.verify(request).await;
    assert_eq!(report.verdict, Verdict::Success, "{report:?}");
    assert_eq!(
        report.baseline.as_ref().and_then(|sample| sample.current_avg),
        Some(4.2)
    );
    assert_eq!(
        report.final_sample.as_ref().and_then(|sample| sample.current_avg),
        Some(0.05)
    );
    assert!(report.elapsed_ms < 3_000);
    assert_eq!(sim.relay_closed("MTR-002", "relay-1"), Some(false));
    assert_eq!(sim.audit_len(), 1);

    let entries = core.refresh_audit_log().await.expect("audit log");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].action, "trip");
    assert_eq!(entries[0].operator, "operator");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_target_is_rejected_with_server_message() {
    let (base, sim) = spawn_sim(SimState::demo(SimConfig::default())).await;
    let core = ControlCore::connect(config_for(&base, None));

    let err = core
        .execute(CommandRequest::new("MTR-001", ControlAction::Close, "relay-9"))
        .await
        .expect_err("unknown target");
    assert_eq!(
        err,
        ControlError::Rejected("unknown control target relay-9".to_string())
    );
    assert!(core.get_status("MTR-001").is_empty());
    assert_eq!(sim.audit_len(), 0);
}
