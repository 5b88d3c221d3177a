//! Integration tests: HTTP ledger and relayer clients against a local stub server.

mod common;

use common::{init_tracing, make_log, rpc_log_json, tx_id, StubServer, CONTRACT};
use listener::{
    normalize, Coordinator, HttpLedger, HttpSink, LedgerReader, ListenerConfig, PersistedState,
    CheckpointStore, FileCheckpointStore, IterationOutcome, RawLog, Shutdown, SinkError, SinkNotifier,
    TransportError,
};
use serde_json::{json, Value};
use std::time::Duration;

fn rpc_reply(id: &Value, result: Value) -> (u16, String) {
    (200, json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string())
}

fn parse_block(v: &Value) -> u64 {
    u64::from_str_radix(v.as_str().unwrap().trim_start_matches("0x"), 16).unwrap()
}

/// JSON-RPC stub: fixed head plus a log list filtered by the requested range.
async fn rpc_stub(height: u64, logs: Vec<RawLog>, reject_topic_filter: bool) -> StubServer {
    StubServer::start(move |body| {
        let req: Value = serde_json::from_str(body).unwrap();
        let id = req["id"].clone();
        match req["method"].as_str().unwrap() {
            "eth_blockNumber" => rpc_reply(&id, json!(format!("0x{:x}", height))),
            "eth_getLogs" => {
                let params = &req["params"][0];
                if reject_topic_filter && params.get("topics").is_some() {
                    return (
                        200,
                        json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32602, "message": "topics unsupported"}})
                            .to_string(),
                    );
                }
                let from = parse_block(&params["fromBlock"]);
                let to = parse_block(&params["toBlock"]);
                let matching: Vec<Value> = logs
                    .iter()
                    .filter(|l| {
                        let b = u64::from_str_radix(
                            l.block_number.as_deref().unwrap().trim_start_matches("0x"),
                            16,
                        )
                        .unwrap();
                        b >= from && b <= to
                    })
                    .map(rpc_log_json)
                    .collect();
                rpc_reply(&id, Value::Array(matching))
            }
            other => (400, format!("unexpected method {}", other)),
        }
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn ledger_reads_height_and_logs() {
    init_tracing();
    let server = rpc_stub(0x73, vec![make_log(105, 2, 0x01), make_log(120, 0, 0x02)], false).await;
    let ledger = HttpLedger::new(&server.url, Duration::from_secs(5)).unwrap();

    assert_eq!(ledger.current_height().await.unwrap(), 115);
    let logs = ledger.logs_in_range(101, 110, &common::filter()).await.unwrap();
    assert_eq!(logs.len(), 1);
    let ev = normalize(&logs[0]).unwrap();
    assert_eq!(ev.tx_id(), tx_id(0x01));
    assert_eq!(ev.position(), (105, 2));

    let bodies = server.bodies();
    let get_logs: Value = serde_json::from_str(&bodies[1]).unwrap();
    assert_eq!(get_logs["method"], "eth_getLogs");
    assert_eq!(get_logs["params"][0]["fromBlock"], "0x65");
    assert_eq!(get_logs["params"][0]["toBlock"], "0x6e");
    assert_eq!(get_logs["params"][0]["address"], format!("0x{}", hex::encode(CONTRACT)));
}

#[tokio::test]
async fn ledger_falls_back_to_address_only_filter() {
    init_tracing();
    let mut foreign = make_log(106, 0, 0x03);
    foreign.topics[0] = format!("0x{}", "ee".repeat(32));
    let server = rpc_stub(200, vec![make_log(105, 0, 0x01), foreign], true).await;
    let ledger = HttpLedger::new(&server.url, Duration::from_secs(5)).unwrap();

    let logs = ledger.logs_in_range(101, 110, &common::filter()).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].transaction_hash.as_deref(), Some(tx_id(0x01).as_str()));
    assert_eq!(server.bodies().len(), 2);
}

#[tokio::test]
async fn ledger_http_error_is_transport_error() {
    init_tracing();
    let server = StubServer::start(|_| (502, "bad gateway".into())).await.unwrap();
    let ledger = HttpLedger::new(&server.url, Duration::from_secs(5)).unwrap();
    let err = ledger.current_height().await.unwrap_err();
    assert!(matches!(err, TransportError::Http(_)));
}

#[tokio::test]
async fn sink_posts_relay_request() {
    init_tracing();
    let server = StubServer::start(|_| (202, "{\"queued\":true}".into())).await.unwrap();
    let sink = HttpSink::new(format!("{}/relay", server.url), Duration::from_secs(5)).unwrap();
    let ev = normalize(&make_log(105, 0, 0x01)).unwrap();

    let ack = sink.deliver(&ev).await.unwrap();
    assert_eq!(ack.status, 202);

    let requests = server.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].path, "/relay");
    let body: Value = serde_json::from_str(&requests[0].body).unwrap();
    assert_eq!(body["sourceTransactionHash"], tx_id(0x01));
    assert_eq!(body["sourceBlockNumber"], 105);
    assert_eq!(body["recipient"], format!("0x{}", "aa".repeat(20)));
    assert_eq!(body["tokenAddress"], format!("0x{}", "bb".repeat(20)));
    assert_eq!(body["amount"], "1105");
    assert_eq!(body["targetChainId"], "137");
}

#[tokio::test]
async fn sink_classifies_failures() {
    init_tracing();
    let ev = normalize(&make_log(105, 0, 0x01)).unwrap();

    let server = StubServer::start(|_| (503, "try later".into())).await.unwrap();
    let sink = HttpSink::new(&server.url, Duration::from_secs(5)).unwrap();
    let err = sink.deliver(&ev).await.unwrap_err();
    assert!(err.is_transient());

    let server = StubServer::start(|_| (400, "bad token".into())).await.unwrap();
    let sink = HttpSink::new(&server.url, Duration::from_secs(5)).unwrap();
    match sink.deliver(&ev).await.unwrap_err() {
        SinkError::Rejected { status, body } => {
            assert_eq!(status, 400);
            assert_eq!(body, "bad token");
        }
        other => panic!("expected rejection, got {:?}", other),
    }

    // Nothing listening.
    let sink = HttpSink::new("http://127.0.0.1:1", Duration::from_millis(200)).unwrap();
    assert!(sink.deliver(&ev).await.unwrap_err().is_transient());
}

#[tokio::test]
async fn coordinator_from_config_end_to_end() {
    init_tracing();
    let rpc = rpc_stub(115, vec![make_log(105, 0, 0x01), make_log(112, 0, 0x02)], false).await;
    let relayer = StubServer::start(|_| (200, "{}".into())).await.unwrap();
    let dir = tempfile::tempdir().unwrap();

    let mut config = ListenerConfig::new(&rpc.url, &relayer.url, CONTRACT);
    config.confirmation_depth = 5;
    config.start_block = Some(100);
    config.state_file = dir.path().join("listener_state.json");
    config.retry = common::fast_retry(2);
    let mut coordinator = Coordinator::from_config(&config).unwrap();
    coordinator.init().await.unwrap();

    let outcome = coordinator.run_iteration(&mut Shutdown::never()).await.unwrap();
    assert!(matches!(outcome, IterationOutcome::Advanced { .. }));
    let posted: Vec<Value> = relayer
        .bodies()
        .iter()
        .map(|b| serde_json::from_str(b).unwrap())
        .collect();
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0]["sourceTransactionHash"], tx_id(0x01));

    let state = FileCheckpointStore::new(&config.state_file).load().unwrap().unwrap();
    assert_eq!(state, PersistedState::new(110, vec![tx_id(0x01)]));
}
