use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use tether::transport::{JsonLinesSink, JsonLinesSource};
use tether::{HostConnection, HostError, InboundMessage, Notification, OutboundFrame};
use tokio::process::Command;

mod handlers;

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Tether CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Serve the demo handlers (ping, echo, add, sleep, fail, log) as JSON lines on stdin/stdout.
    Worker {
        /// Config file path (default: TETHER_CONFIG_PATH or ~/.tether/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Spawn a worker, send it one request, and print the response. Exits with 1 on rejection.
    Call {
        /// Handler name
        #[arg(long, short)]
        name: String,

        /// Request payload as JSON (default: null)
        #[arg(long, short, value_name = "JSON")]
        data: Option<String>,

        /// Config file path, also passed to the worker
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Worker executable (default: this binary, run as `tether worker`)
        #[arg(long, short, value_name = "PATH")]
        worker: Option<PathBuf>,
    },
}

fn logger_builder() -> env_logger::Builder {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // the worker installs its own forwarding logger around env_logger
    if !matches!(cli.command, Some(Commands::Worker { .. })) {
        logger_builder().init();
    }

    match cli.command {
        Some(Commands::Version) => {
            println!("tether {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Worker { config }) => {
            if let Err(e) = run_worker(config).await {
                eprintln!("worker failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Call {
            name,
            data,
            config,
            worker,
        }) => match run_call(name, data, config, worker).await {
            Ok(true) => {}
            Ok(false) => std::process::exit(1),
            Err(e) => {
                log::error!("call failed: {:#}", e);
                std::process::exit(1);
            }
        },
        None => {
            println!("Run with --help for usage");
        }
    }
}

async fn run_worker(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (config, _path) = tether::config::load_config(config_path)?;
    let logger = logger_builder().build();
    let filter = logger.filter();
    tether::worker::run_stdio_worker(&config, handlers::demo_table(), Box::new(logger), filter).await
}

/// Returns `Ok(false)` when the worker rejected the request.
async fn run_call(
    name: String,
    data: Option<String>,
    config_path: Option<PathBuf>,
    worker: Option<PathBuf>,
) -> anyhow::Result<bool> {
    let (config, _path) = tether::config::load_config(config_path.clone())?;
    let data: Value = match data {
        Some(s) => serde_json::from_str(&s).context("parsing --data as JSON")?,
        None => Value::Null,
    };
    let exe = match worker {
        Some(path) => path,
        None => std::env::current_exe().context("locating the tether executable")?,
    };

    let mut cmd = Command::new(&exe);
    cmd.arg("worker");
    if let Some(path) = &config_path {
        cmd.arg("--config").arg(path);
    }
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning worker {}", exe.display()))?;
    let stdin = child.stdin.take().context("no stdin from worker")?;
    let stdout = child.stdout.take().context("no stdout from worker")?;

    let (sink, writer) = JsonLinesSink::<InboundMessage>::spawn(stdin, config.transport.max_frame_bytes);
    let source = JsonLinesSource::<OutboundFrame, _>::new(stdout);
    let (conn, mut notes) = HostConnection::connect(sink, source);
    let printer = tokio::spawn(async move {
        while let Some(note) = notes.recv().await {
            print_notification(&note);
        }
    });

    log::debug!("sending {} to {}", name, exe.display());
    let outcome = conn.request(name, data).await;

    // closing our side ends the worker's stdin; it exits once in-flight work is done
    conn.close().await;
    writer.finish().await.context("closing worker stdin")?;
    let status = child.wait().await.context("waiting for worker to exit")?;
    if !status.success() {
        log::warn!("worker exited with {}", status);
    }
    let _ = printer.await;

    match outcome {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(true)
        }
        Err(HostError::Rejected(record)) => {
            println!("{}", serde_json::to_string_pretty(&record.to_value())?);
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

fn print_notification(note: &Notification) {
    match note {
        Notification::Console(payload) => {
            let text = match &payload.args {
                Value::Array(args) => args
                    .iter()
                    .map(|a| match a {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(" "),
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            eprintln!("[worker {}] {}", payload.level, text);
        }
        Notification::Error(record) => {
            eprintln!("[worker error] {}", record.message);
            if !record.stack.is_empty() {
                eprintln!("{}", record.stack);
            }
        }
    }
}
