//! Handler table: message name → handler. Built once, immutable afterwards.

use super::context::MessageContext;
use anyhow::Context as _;
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Boxed handler future. `Err` (or a panic) becomes a `respond_reject`.
pub type HandlerFuture = BoxFuture<'static, anyhow::Result<Value>>;

/// Type-erased handler.
pub type Handler = Arc<dyn Fn(MessageContext) -> HandlerFuture + Send + Sync>;

/// Immutable mapping from message name to handler.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<String, Handler>,
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerTable")
            .field("names", &self.names())
            .finish()
    }
}

impl HandlerTable {
    pub fn builder() -> HandlerTableBuilder {
        HandlerTableBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&Handler> {
        self.handlers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Collects handlers before the table is frozen.
#[derive(Default)]
pub struct HandlerTableBuilder {
    handlers: HashMap<String, Handler>,
}

impl HandlerTableBuilder {
    /// Register an untyped handler. A second registration under the same name replaces the first.
    pub fn handle<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let name = name.into();
        let handler: Handler = Arc::new(move |ctx| Box::pin(f(ctx)));
        if self.handlers.insert(name.clone(), handler).is_some() {
            log::warn!("handler for {} registered twice; keeping the last one", name);
        }
        self
    }

    /// Register a handler whose payload is deserialized into `P` and whose output is serialized.
    /// A payload that does not match `P` fails the request.
    pub fn handle_typed<P, R, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(P, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.handle(name, move |ctx: MessageContext| {
            let f = f.clone();
            async move {
                let params: P = serde_json::from_value(ctx.data().clone())
                    .with_context(|| format!("invalid payload for {}", ctx.name()))?;
                let out = f(params, ctx).await?;
                serde_json::to_value(out).context("serializing handler output")
            }
        })
    }

    pub fn build(self) -> HandlerTable {
        HandlerTable {
            handlers: self.handlers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::InboundMessage;
    use crate::worker::context::tests::RecordingSink;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Add {
        a: i64,
        b: i64,
    }

    fn ctx(name: &str, data: Value) -> MessageContext {
        MessageContext::new(
            InboundMessage::new("1", name, data),
            Arc::new(RecordingSink::default()),
        )
    }

    #[tokio::test]
    async fn typed_handler_decodes_payload() {
        let table = HandlerTable::builder()
            .handle_typed("add", |p: Add, _ctx| async move { anyhow::Ok(p.a + p.b) })
            .build();
        let handler = table.get("add").unwrap();
        let out = handler(ctx("add", json!({ "a": 2, "b": 3 }))).await.unwrap();
        assert_eq!(out, json!(5));
    }

    #[tokio::test]
    async fn typed_handler_reports_bad_payload() {
        let table = HandlerTable::builder()
            .handle_typed("add", |p: Add, _ctx| async move { anyhow::Ok(p.a + p.b) })
            .build();
        let handler = table.get("add").unwrap();
        let err = handler(ctx("add", json!("nope"))).await.unwrap_err();
        assert_eq!(err.to_string(), "invalid payload for add");
    }

    #[test]
    fn later_registration_replaces_earlier() {
        let table = HandlerTable::builder()
            .handle("ping", |_ctx| async { anyhow::Ok(json!("first")) })
            .handle("ping", |_ctx| async { anyhow::Ok(json!("second")) })
            .handle("echo", |ctx| async move { anyhow::Ok(ctx.data().clone()) })
            .build();
        assert_eq!(table.len(), 2);
        assert_eq!(table.names(), vec!["echo", "ping"]);
        assert!(table.contains("ping"));
        assert!(!table.contains("pong"));
    }
}
