mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use axum::http::StatusCode;
use onion::consistency::DiscrepancyKind;
use onion::layer::LayerId;

use common::{
    closed_endpoint, config_toml, configured_harness, content_paths, echo_path, echo_path_archived,
    fixed, harness, spawn_truncating_layer, write_replay_log, LayerSpec, MockLayer,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn agreeing_layers_report_no_discrepancies() {
    let kubo = MockLayer::spawn(echo_path()).await;
    let lassie = MockLayer::spawn(echo_path()).await;
    let shim = MockLayer::spawn(echo_path_archived()).await;
    let dir = tempfile::tempdir().expect("tempdir");

    let toml = config_toml(
        &[
            LayerSpec::raw("kubo", kubo.endpoint()),
            LayerSpec::raw("lassie", lassie.endpoint()),
            LayerSpec::car("l1-shim", shim.endpoint()),
        ],
        3,
    );
    let harness = harness(&toml, dir.path());
    let replay = write_replay_log(dir.path(), &content_paths(12));
    let requests = harness.load_requests(&replay, 12).expect("requests");

    let outcome = harness.run_round(1, &requests).await.expect("round");
    let summary = &outcome.summary;
    assert_eq!(summary.total_paths, 12);
    for layer in [LayerId::Kubo, LayerId::Lassie, LayerId::L1Shim] {
        assert_eq!(summary.layers[&layer].successful_reads, 12, "{layer}");
    }
    assert_eq!(summary.pairs["kubo-lassie"].content_matches, 12);
    assert_eq!(summary.pairs["kubo-l1-shim"].content_matches, 12);
    for kind in DiscrepancyKind::ALL {
        assert_eq!(summary.mismatch_total(kind), 0);
    }
    assert!(outcome.dispatch.repaired.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_candidate_is_a_status_mismatch() {
    let kubo = MockLayer::spawn(echo_path()).await;
    let lassie = MockLayer::spawn(fixed(StatusCode::BAD_GATEWAY, "no providers")).await;
    let dir = tempfile::tempdir().expect("tempdir");

    let toml = config_toml(
        &[
            LayerSpec::raw("kubo", kubo.endpoint()),
            LayerSpec::raw("lassie", lassie.endpoint()),
        ],
        2,
    );
    let harness = harness(&toml, dir.path());
    let replay = write_replay_log(dir.path(), &content_paths(4));
    let requests = harness.load_requests(&replay, 4).expect("requests");

    let outcome = harness.run_round(1, &requests).await.expect("round");
    let pair = &outcome.summary.pairs["kubo-lassie"];
    assert_eq!(pair.status_mismatches, 4);
    assert_eq!(pair.content_mismatches, 0);
    assert_eq!(pair.content_matches, 0);
    assert_eq!(outcome.summary.layers[&LayerId::Lassie].status_codes[&502], 4);

    let report: serde_json::Value = serde_json::from_slice(
        &std::fs::read(outcome.dir.join("kubo-lassie-status-mismatches.json")).expect("report"),
    )
    .expect("json");
    let entry = &report["/ipfs/bafy0000"];
    assert_eq!(entry["kubo"]["status"], 200);
    assert_eq!(entry["lassie"]["status"], 502);
    assert_eq!(entry["lassie"]["error_body"], "no providers");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn differing_bytes_are_a_content_mismatch() {
    let kubo = MockLayer::spawn(echo_path()).await;
    let shim = MockLayer::spawn(Arc::new(|path: &str| {
        let body = if path.ends_with("0001") {
            "CAR:corrupted".to_string()
        } else {
            format!("CAR:{path}")
        };
        (StatusCode::OK, body.into_bytes())
    }))
    .await;
    let dir = tempfile::tempdir().expect("tempdir");

    let toml = config_toml(
        &[
            LayerSpec::raw("kubo", kubo.endpoint()),
            LayerSpec::car("l1-shim", shim.endpoint()),
        ],
        2,
    );
    let harness = harness(&toml, dir.path());
    let replay = write_replay_log(dir.path(), &content_paths(3));
    let requests = harness.load_requests(&replay, 3).expect("requests");

    let outcome = harness.run_round(1, &requests).await.expect("round");
    let pair = &outcome.summary.pairs["kubo-l1-shim"];
    assert_eq!(pair.content_mismatches, 1);
    assert_eq!(pair.content_matches, 2);
    assert_eq!(pair.status_mismatches, 0);

    let paths: Vec<String> = serde_json::from_slice(
        &std::fs::read(outcome.dir.join("kubo-l1-shim-content-mismatches-paths.json"))
            .expect("paths report"),
    )
    .expect("json");
    assert_eq!(paths, vec!["/ipfs/bafy0001".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn undecodable_archive_is_a_decode_error() {
    let kubo = MockLayer::spawn(echo_path()).await;
    let shim = MockLayer::spawn(fixed(StatusCode::OK, "not an archive")).await;
    let dir = tempfile::tempdir().expect("tempdir");

    let toml = config_toml(
        &[
            LayerSpec::raw("kubo", kubo.endpoint()),
            LayerSpec::car("l1-shim", shim.endpoint()),
        ],
        1,
    );
    let harness = harness(&toml, dir.path());
    let replay = write_replay_log(dir.path(), &content_paths(2));
    let requests = harness.load_requests(&replay, 2).expect("requests");

    let outcome = harness.run_round(1, &requests).await.expect("round");
    let pair = &outcome.summary.pairs["kubo-l1-shim"];
    assert_eq!(pair.decode_errors, 2);
    assert_eq!(pair.content_mismatches, 0);
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hung_decoder_becomes_a_decode_error_and_keeps_the_archive() {
    let kubo = MockLayer::spawn(echo_path()).await;
    let shim = MockLayer::spawn(echo_path_archived()).await;
    let dir = tempfile::tempdir().expect("tempdir");

    let toml = config_toml(
        &[
            LayerSpec::raw("kubo", kubo.endpoint()),
            LayerSpec::car("l1-shim", shim.endpoint()),
        ],
        2,
    )
    .replace(
        "car_command = [\"cat\"]",
        "car_command = [\"sh\", \"-c\", \"cat >/dev/null; sleep 30\"]\ndecode_timeout_secs = 1",
    );
    let harness = configured_harness(&toml, dir.path());
    let replay = write_replay_log(dir.path(), &content_paths(2));
    let requests = harness.load_requests(&replay, 2).expect("requests");

    let started = Instant::now();
    let outcome = harness.run_round(1, &requests).await.expect("round");
    assert!(started.elapsed() < Duration::from_secs(15), "{:?}", started.elapsed());

    let pair = &outcome.summary.pairs["kubo-l1-shim"];
    assert_eq!(pair.decode_errors, 2);
    assert_eq!(pair.content_mismatches + pair.content_matches, 0);

    let report: serde_json::Value = serde_json::from_slice(
        &std::fs::read(outcome.dir.join("kubo-l1-shim-decode-errors.json")).expect("report"),
    )
    .expect("json");
    assert_eq!(report.as_object().map(|entries| entries.len()), Some(2));
    let archive = std::fs::read(outcome.dir.join("decode-errors").join("l1-shim-bafy0001.car"))
        .expect("archive kept");
    assert_eq!(archive, b"CAR:/ipfs/bafy0001");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn truncated_body_is_a_read_error_and_excluded() {
    let kubo = MockLayer::spawn(echo_path()).await;
    let (truncating, _server) = spawn_truncating_layer().await;
    let dir = tempfile::tempdir().expect("tempdir");

    let toml = config_toml(
        &[
            LayerSpec::raw("kubo", kubo.endpoint()),
            LayerSpec::raw("lassie", truncating.to_string()),
        ],
        2,
    );
    let harness = harness(&toml, dir.path());
    let replay = write_replay_log(dir.path(), &content_paths(2));
    let requests = harness.load_requests(&replay, 2).expect("requests");

    let outcome = harness.run_round(1, &requests).await.expect("round");
    let lassie = &outcome.summary.layers[&LayerId::Lassie];
    assert_eq!(lassie.read_errors, 2);
    assert_eq!(lassie.successful_reads, 0);
    let pair = &outcome.summary.pairs["kubo-lassie"];
    assert_eq!(pair.excluded, 2);
    assert_eq!(pair.status_mismatches + pair.content_mismatches + pair.content_matches, 0);

    let report: serde_json::Value = serde_json::from_slice(
        &std::fs::read(outcome.dir.join("lassie-2xx-read-errors.json")).expect("report"),
    )
    .expect("json");
    let entry = &report["/ipfs/bafy0001"];
    assert_eq!(entry["status"], 200);
    assert_matches!(
        entry["body_read_error"].as_str(),
        Some(message) if message.starts_with("error reading response body")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_layer_does_not_affect_the_others() {
    let kubo = MockLayer::spawn(echo_path()).await;
    let lassie = MockLayer::spawn(echo_path()).await;
    let dir = tempfile::tempdir().expect("tempdir");

    let toml = config_toml(
        &[
            LayerSpec::raw("kubo", kubo.endpoint()),
            LayerSpec::raw("lassie", lassie.endpoint()),
            LayerSpec::raw("bifrost", closed_endpoint()),
        ],
        2,
    );
    let harness = harness(&toml, dir.path());
    let replay = write_replay_log(dir.path(), &content_paths(5));
    let requests = harness.load_requests(&replay, 5).expect("requests");

    let outcome = harness.run_round(1, &requests).await.expect("round");
    let summary = &outcome.summary;
    assert_eq!(summary.layers[&LayerId::Bifrost].transport_errors, 5);
    assert_eq!(summary.layers[&LayerId::Bifrost].status_codes[&0], 5);
    assert_eq!(summary.layers[&LayerId::Lassie].successful_reads, 5);
    assert_eq!(summary.pairs["kubo-lassie"].content_matches, 5);
    assert_eq!(summary.pairs["kubo-bifrost"].status_mismatches, 5);

    let results: serde_json::Value = serde_json::from_slice(
        &std::fs::read(outcome.dir.join("results.json")).expect("results"),
    )
    .expect("json");
    let failed = &results["/ipfs/bafy0003"]["bifrost"];
    assert_eq!(failed["status"], 0);
    assert_matches!(
        failed["error_body"].as_str(),
        Some(message) if message.starts_with("error sending request")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn in_flight_calls_stay_within_concurrency_times_layers() {
    let delay = Some(Duration::from_millis(100));
    let kubo = MockLayer::spawn_with_delay(echo_path(), delay).await;
    let lassie = MockLayer::spawn_with_delay(echo_path(), delay).await;
    let nginx = MockLayer::spawn_with_delay(echo_path(), delay).await;
    let dir = tempfile::tempdir().expect("tempdir");

    let concurrency = 2;
    let toml = config_toml(
        &[
            LayerSpec::raw("kubo", kubo.endpoint()),
            LayerSpec::raw("lassie", lassie.endpoint()),
            LayerSpec::raw("l1-nginx", nginx.endpoint()),
        ],
        concurrency,
    );
    let harness = harness(&toml, dir.path());
    let replay = write_replay_log(dir.path(), &content_paths(10));
    let requests = harness.load_requests(&replay, 10).expect("requests");

    let outcome = harness.run_round(1, &requests).await.expect("round");
    let peak = outcome.dispatch.peak_in_flight;
    assert!(peak <= concurrency * 3, "peak {peak} exceeds bound");
    assert!(peak >= 3, "layers of one path should overlap, peak {peak}");
    assert_eq!(outcome.summary.total_paths, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_round_gets_its_own_report_directory() {
    let kubo = MockLayer::spawn(echo_path()).await;
    let lassie = MockLayer::spawn(echo_path()).await;
    let dir = tempfile::tempdir().expect("tempdir");

    let toml = config_toml(
        &[
            LayerSpec::raw("kubo", kubo.endpoint()),
            LayerSpec::raw("lassie", lassie.endpoint()),
        ],
        2,
    );
    let harness = harness(&toml, dir.path());
    let replay = write_replay_log(dir.path(), &content_paths(3));
    let requests = harness.load_requests(&replay, 3).expect("requests");

    let outcomes = harness.run(&requests, 2).await.expect("rounds");
    assert_eq!(outcomes.len(), 2);
    for (index, outcome) in outcomes.iter().enumerate() {
        assert_eq!(outcome.dir, dir.path().join(format!("results-{}", index + 1)));
        assert!(outcome.dir.join("top-level-metrics.json").is_file());
        assert_eq!(outcome.summary.total_paths, 3);
    }
}
