//! Integration test: workers driven over an in-process channel pair and over JSON lines.

use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tether::transport::{channel, FrameSink, FrameSource, JsonLinesSink, JsonLinesSource};
use tether::worker::{self, OutboundSink};
use tether::{Dispatcher, FrameName, HandlerError, HandlerTable, HostConnection, HostError, InboundMessage, OutboundFrame};

#[derive(Deserialize)]
struct Add {
    a: i64,
    b: i64,
}

fn demo_table() -> HandlerTable {
    HandlerTable::builder()
        .handle_typed("add", |p: Add, _ctx| async move { anyhow::Ok(p.a + p.b) })
        .handle_typed("sleep", |ms: u64, _ctx| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            anyhow::Ok(ms)
        })
        .handle("quota", |_ctx| async {
            let err = HandlerError::new("over quota")
                .with_field("code", 429)
                .with_field("message", "overridden?");
            Err::<Value, _>(anyhow::Error::new(err))
        })
        .build()
}

fn start_worker(table: HandlerTable) -> (HostConnection, tokio::task::JoinHandle<()>) {
    let (host, worker_end) = channel::pair();
    let sink: OutboundSink = Arc::new(worker_end.sink);
    let served = tokio::spawn(worker::serve(table, sink, worker_end.source));
    let (conn, _notes) = HostConnection::connect(host.sink, host.source);
    (conn, served)
}

#[tokio::test]
async fn add_produces_the_documented_wire_frame() {
    let (host, worker_end) = channel::pair();
    let sink: OutboundSink = Arc::new(worker_end.sink);
    let served = tokio::spawn(worker::serve(demo_table(), sink, worker_end.source));

    let mut source = host.source;
    host.sink
        .send(InboundMessage::new("1", "add", json!({ "a": 2, "b": 3 })))
        .unwrap();
    let frame: OutboundFrame = source.recv().await.unwrap().unwrap();
    assert_eq!(
        serde_json::to_value(&frame).unwrap(),
        json!({ "id": "1", "name": "respond_resolve", "data": 5 })
    );

    drop(host.sink);
    served.await.unwrap();
}

#[tokio::test]
async fn unknown_name_is_rejected_over_the_wire() {
    let (host, worker_end) = channel::pair();
    let sink: OutboundSink = Arc::new(worker_end.sink);
    let served = tokio::spawn(worker::serve(HandlerTable::builder().build(), sink, worker_end.source));

    let mut source = host.source;
    host.sink.send(InboundMessage::new("2", "ping", Value::Null)).unwrap();
    let frame = serde_json::to_value(source.recv().await.unwrap().unwrap()).unwrap();
    assert_eq!(frame["id"], json!("2"));
    assert_eq!(frame["name"], json!("respond_reject"));
    assert_eq!(frame["data"]["message"], json!("No handler for ping"));

    drop(host.sink);
    served.await.unwrap();
}

#[tokio::test]
async fn handler_fields_survive_but_message_is_reserved() {
    let (conn, _served) = start_worker(demo_table());
    match conn.request("quota", Value::Null).await {
        Err(HostError::Rejected(record)) => {
            assert_eq!(record.message, "over quota");
            assert!(record.stack.contains("over quota"));
            assert_eq!(record.fields.get("code"), Some(&json!(429)));
            assert!(!record.fields.contains_key("message"));
        }
        other => panic!("expected rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn concurrent_requests_complete_out_of_order() {
    let (conn, _served) = start_worker(demo_table());
    let conn = Arc::new(conn);

    let slow = tokio::spawn({
        let conn = conn.clone();
        async move {
            let v = conn.request("sleep", json!(80)).await;
            (v, tokio::time::Instant::now())
        }
    });
    tokio::time::sleep(Duration::from_millis(5)).await;
    let fast = conn.request("sleep", json!(1)).await.unwrap();
    let fast_done = tokio::time::Instant::now();

    let (slow_value, slow_done) = slow.await.unwrap();
    assert_eq!(fast, json!(1));
    assert_eq!(slow_value.unwrap(), json!(80));
    assert!(fast_done < slow_done);
    assert_eq!(conn.pending_count(), 0);
}

#[tokio::test]
async fn pending_requests_fail_when_the_worker_goes_away() {
    let (host, worker_end) = channel::pair();
    let (conn, _notes) = HostConnection::connect(host.sink, host.source);
    let mut inbound = worker_end.source;
    let outbound = worker_end.sink;

    let worker = tokio::spawn(async move {
        let received = inbound.recv().await;
        drop(outbound);
        received.map(|r| r.map(|m| m.name).ok())
    });

    let err = conn.request("never_answered", Value::Null).await.unwrap_err();
    assert!(matches!(err, HostError::Disconnected));
    assert_eq!(worker.await.unwrap(), Some(Some("never_answered".to_string())));
    assert!(!conn.is_connected());
}

#[tokio::test]
async fn oversized_rejection_still_reaches_the_host_over_json_lines() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (sink, writer) = JsonLinesSink::<OutboundFrame>::spawn(client, 4096);
    let mut source = JsonLinesSource::<OutboundFrame, _>::new(server);

    let table = HandlerTable::builder()
        .handle("parse", |_ctx| async {
            Err::<Value, _>(anyhow::anyhow!("bad input: {}", "x".repeat(3000)))
        })
        .build();
    let sink: OutboundSink = Arc::new(sink);
    Dispatcher::new(table, sink.clone())
        .dispatch(InboundMessage::new("7", "parse", Value::Null))
        .await;
    drop(sink);
    writer.finish().await.unwrap();

    let frame = source.recv().await.unwrap().unwrap();
    assert_eq!(frame.id.as_deref(), Some("7"));
    assert_eq!(frame.name, FrameName::RespondReject);
    assert!(frame.data["message"].as_str().unwrap().starts_with("bad input: xxx"));
    assert!(source.recv().await.is_none());
}
