//! Diagnostics forwarding: panics, failed detached tasks, and log output leave the worker as
//! uncorrelated `error` / `console` notifications.
//!
//! [`DiagnosticsForwarder`] owns every process-global hook it touches. `install` wraps the
//! original logger and chains the previous panic hook; `uninstall` stops forwarding and
//! restores the previous hook. The `log` facade does not allow removing a logger, so after
//! uninstall the wrapper stays registered as a pass-through to the original.

use super::context::OutboundSink;
use super::handlers::HandlerFuture;
use crate::config::DiagnosticsConfig;
use crate::errors::ErrorRecord;
use crate::protocol::{ConsoleLevel, ConsolePayload, OutboundFrame};
use crate::transport::{fit_json_string, string_budget, TransportError, TRUNCATION_MARKER};
use log::{LevelFilter, Log, Metadata, Record};
use serde::Serialize;
use serde_json::Value;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::cell::{Cell, RefCell};
use std::fmt::Debug;
use std::future::Future;
use std::panic::{self, PanicHookInfo};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::task::JoinHandle;

type PreviousHook = Arc<dyn Fn(&PanicHookInfo<'_>) + Send + Sync + 'static>;

thread_local! {
    /// Nesting depth of dispatcher handler polls on this thread.
    static HANDLER_DEPTH: Cell<usize> = const { Cell::new(0) };
    /// Stack captured by the panic hook for a panic the dispatcher is about to catch.
    static CONTAINED_PANIC: RefCell<Option<String>> = const { RefCell::new(None) };
    /// Set while a notification is being sent; log records emitted meanwhile are not forwarded.
    static FORWARDING: Cell<bool> = const { Cell::new(false) };
}

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("a global logger is already set: {0}")]
    LoggerAlreadySet(#[from] log::SetLoggerError),
}

/// State shared by the forwarder, its logger, and its panic hook.
struct DiagnosticsSink {
    sink: OutboundSink,
    config: DiagnosticsConfig,
    active: AtomicBool,
}

impl DiagnosticsSink {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn forwards_console(&self) -> bool {
        self.is_active() && self.config.forward_console
    }

    fn forwards_errors(&self) -> bool {
        self.is_active() && self.config.forward_errors
    }

    fn send_console(&self, level: ConsoleLevel, args: Value) {
        if !self.forwards_console() {
            return;
        }
        let _guard = ForwardGuard::enter();
        let payload = ConsolePayload { level, args };
        match self.sink.send(OutboundFrame::console(&payload)) {
            Ok(()) => {}
            Err(e) if e.is_frame_rejected() => {
                let text = match &payload.args {
                    Value::String(s) => s.clone(),
                    args => serde_json::to_string(args).unwrap_or_else(|_| format!("{:?}", args)),
                };
                let empty = OutboundFrame::console(&ConsolePayload {
                    level,
                    args: Value::String(String::new()),
                });
                let degraded = ConsolePayload {
                    level,
                    args: Value::String(self.degrade(&text, &e, &empty)),
                };
                if let Err(e) = self.sink.send(OutboundFrame::console(&degraded)) {
                    report_lost("console", &e);
                }
            }
            Err(e) => report_lost("console", &e),
        }
    }

    fn send_error(&self, record: ErrorRecord) {
        if !self.forwards_errors() {
            return;
        }
        let _guard = ForwardGuard::enter();
        match self.sink.send(OutboundFrame::error(record.to_value())) {
            Ok(()) => {}
            Err(e) if e.is_frame_rejected() => {
                let empty = OutboundFrame::error(Value::String(String::new()));
                let message = Value::String(self.degrade(&record.message, &e, &empty));
                if let Err(e) = self.sink.send(OutboundFrame::error(message)) {
                    report_lost("error", &e);
                }
            }
            Err(e) => report_lost("error", &e),
        }
    }

    /// Cut `text` to the configured length and, when the sink reported a byte limit, to what
    /// fits in `empty_frame` under that limit.
    fn degrade(&self, text: &str, refused: &TransportError, empty_frame: &OutboundFrame) -> String {
        let text = truncate(text, self.config.degraded_max_chars);
        match refused.frame_limit() {
            Some(limit) => fit_json_string(&text, string_budget(limit, empty_frame)),
            None => text,
        }
    }
}

fn report_lost(kind: &str, e: &TransportError) {
    match e {
        TransportError::Closed => log::debug!("{} notification dropped: channel closed", kind),
        other => log::error!("{} notification could not be sent: {}", kind, other),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str(TRUNCATION_MARKER);
    out
}

struct ForwardGuard {
    outer: bool,
}

impl ForwardGuard {
    fn enter() -> Self {
        Self {
            outer: FORWARDING.with(|f| f.replace(true)),
        }
    }

    fn is_forwarding() -> bool {
        FORWARDING.with(Cell::get)
    }
}

impl Drop for ForwardGuard {
    fn drop(&mut self) {
        FORWARDING.with(|f| f.set(self.outer));
    }
}

struct ScopeGuard;

impl ScopeGuard {
    fn enter() -> Self {
        HANDLER_DEPTH.with(|d| d.set(d.get() + 1));
        ScopeGuard
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        HANDLER_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

fn in_handler_scope() -> bool {
    HANDLER_DEPTH.with(Cell::get) > 0
}

/// Marks every poll of a handler future as handler scope, so the panic hook leaves panics
/// raised there to the dispatcher.
pub(crate) struct HandlerScope {
    inner: HandlerFuture,
}

impl HandlerScope {
    pub(crate) fn new(inner: HandlerFuture) -> Self {
        Self { inner }
    }
}

impl Future for HandlerScope {
    type Output = anyhow::Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let _scope = ScopeGuard::enter();
        self.inner.as_mut().poll(cx)
    }
}

/// Stack captured for the last panic caught inside a handler scope on this thread.
pub(crate) fn take_contained_panic() -> Option<String> {
    CONTAINED_PANIC.with(|c| c.borrow_mut().take())
}

fn panic_stack(info: &PanicHookInfo<'_>) -> String {
    let mut stack = match info.location() {
        Some(loc) => format!("panicked at {}:{}:{}", loc.file(), loc.line(), loc.column()),
        None => "panicked".to_string(),
    };
    let backtrace = Backtrace::capture();
    if backtrace.status() == BacktraceStatus::Captured {
        stack.push('\n');
        stack.push_str(&backtrace.to_string());
    }
    stack
}

/// Forwards worker diagnostics to the host. Construct once at startup.
pub struct DiagnosticsForwarder {
    shared: Arc<DiagnosticsSink>,
    previous_hook: Option<PreviousHook>,
    logger_installed: bool,
}

impl DiagnosticsForwarder {
    pub fn new(sink: OutboundSink, config: DiagnosticsConfig) -> Self {
        Self {
            shared: Arc::new(DiagnosticsSink {
                sink,
                config,
                active: AtomicBool::new(true),
            }),
            previous_hook: None,
            logger_installed: false,
        }
    }

    /// Install the panic hook (when errors are forwarded) and register a [`ForwardingLogger`]
    /// around `inner` as the global logger. `inner_filter` is the level the original logger
    /// itself wants; the global max level becomes the larger of it and the console level.
    pub fn install(&mut self, inner: Box<dyn Log>, inner_filter: LevelFilter) -> Result<(), InstallError> {
        log::set_boxed_logger(Box::new(self.logger(inner)))?;
        self.logger_installed = true;
        let console_filter = if self.shared.config.forward_console {
            self.shared.config.console_level
        } else {
            LevelFilter::Off
        };
        log::set_max_level(inner_filter.max(console_filter));
        if self.shared.config.forward_errors {
            self.install_panic_hook();
        }
        log::debug!("diagnostics forwarding installed");
        Ok(())
    }

    /// Chain a panic hook in front of the current one. Panics outside any handler scope
    /// become `error` notifications; the previous hook still runs for every panic.
    pub fn install_panic_hook(&mut self) {
        if self.previous_hook.is_some() {
            return;
        }
        let previous: PreviousHook = Arc::from(panic::take_hook());
        let chained = previous.clone();
        let shared = self.shared.clone();
        panic::set_hook(Box::new(move |info| {
            let stack = panic_stack(info);
            if in_handler_scope() {
                CONTAINED_PANIC.with(|c| *c.borrow_mut() = Some(stack));
            } else {
                let mut record = ErrorRecord::from_panic(info.payload(), Some(stack));
                if let Some(name) = std::thread::current().name() {
                    record
                        .fields
                        .insert("thread".to_string(), Value::String(name.to_string()));
                }
                shared.send_error(record);
            }
            chained(info);
        }));
        self.previous_hook = Some(previous);
        self.shared.active.store(true, Ordering::SeqCst);
    }

    /// Stop forwarding and put the previous panic hook back.
    pub fn uninstall(&mut self) {
        self.shared.active.store(false, Ordering::SeqCst);
        if let Some(previous) = self.previous_hook.take() {
            if std::thread::panicking() {
                // set_hook panics when called from a panicking thread
                return;
            }
            let _ = panic::take_hook();
            panic::set_hook(Box::new(move |info| previous(info)));
        }
    }

    pub fn is_installed(&self) -> bool {
        self.previous_hook.is_some() || self.logger_installed
    }

    /// Build the wrapping logger without registering it globally.
    pub fn logger(&self, inner: Box<dyn Log>) -> ForwardingLogger {
        ForwardingLogger {
            inner,
            shared: self.shared.clone(),
            level: self.shared.config.console_level,
        }
    }

    /// Forward one console call. Arguments that cannot be serialized are sent as their debug string.
    pub fn console<T: Serialize + Debug>(&self, level: ConsoleLevel, args: &[T]) {
        let args = match serde_json::to_value(args) {
            Ok(v) => v,
            Err(_) => Value::String(truncate(&format!("{:?}", args), self.shared.config.degraded_max_chars)),
        };
        self.shared.send_console(level, args);
    }

    /// Forward a context-level fault that is not tied to any request.
    pub fn report_error(&self, error: impl Into<ErrorRecord>) {
        self.shared.send_error(error.into());
    }

    /// Run a detached task. If it finishes with `Err`, the error is forwarded as an
    /// unhandled rejection. Panics inside it are reported by the panic hook.
    pub fn spawn_supervised<F>(&self, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            if let Err(e) = fut.await {
                shared.send_error(ErrorRecord::from_anyhow(&e));
            }
        })
    }
}

impl Drop for DiagnosticsForwarder {
    fn drop(&mut self) {
        self.uninstall();
    }
}

/// `log::Log` wrapper: forwards each record as a `console` notification, then hands it to
/// the original logger unchanged.
pub struct ForwardingLogger {
    inner: Box<dyn Log>,
    shared: Arc<DiagnosticsSink>,
    level: LevelFilter,
}

impl ForwardingLogger {
    fn forwards(&self, metadata: &Metadata<'_>) -> bool {
        self.shared.forwards_console() && metadata.level() <= self.level
    }
}

impl Log for ForwardingLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        self.forwards(metadata) || self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record<'_>) {
        if self.forwards(record.metadata()) && !ForwardGuard::is_forwarding() {
            let mut message = String::new();
            if std::fmt::write(&mut message, *record.args()).is_err() {
                message.push_str("<formatting failed>");
            }
            self.shared
                .send_console(ConsoleLevel::from(record.level()), Value::Array(vec![Value::String(message)]));
        }
        self.inner.log(record);
    }

    fn flush(&self) {
        self.inner.flush();
    }
}
