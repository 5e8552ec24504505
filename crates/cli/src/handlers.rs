//! Demo handlers served by `tether worker`.

use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tether::{HandlerError, HandlerTable};

#[derive(Deserialize)]
struct Add {
    a: i64,
    b: i64,
}

#[derive(Deserialize)]
struct Fail {
    #[serde(default = "default_fail_message")]
    message: String,
    #[serde(default)]
    code: Option<Value>,
}

fn default_fail_message() -> String {
    "requested failure".to_string()
}

#[derive(Deserialize)]
struct LogLine {
    #[serde(default = "default_log_level")]
    level: log::Level,
    message: String,
}

fn default_log_level() -> log::Level {
    log::Level::Info
}

pub fn demo_table() -> HandlerTable {
    HandlerTable::builder()
        .handle("ping", |_ctx| async { anyhow::Ok(json!("pong")) })
        .handle("echo", |ctx| async move { anyhow::Ok(ctx.data().clone()) })
        .handle_typed("add", |p: Add, _ctx| async move {
            p.a.checked_add(p.b)
                .ok_or_else(|| anyhow::Error::new(HandlerError::new("integer overflow").with_field("code", "EOVERFLOW")))
        })
        // payload is the delay in milliseconds
        .handle_typed("sleep", |ms: u64, _ctx| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            anyhow::Ok(ms)
        })
        .handle_typed("fail", |p: Fail, _ctx| async move {
            let mut err = HandlerError::new(p.message);
            if let Some(code) = p.code {
                err = err.with_field("code", code);
            }
            Err::<Value, _>(anyhow::Error::new(err))
        })
        .handle_typed("log", |p: LogLine, _ctx| async move {
            log::log!(p.level, "{}", p.message);
            anyhow::Ok(Value::Null)
        })
        .build()
}
