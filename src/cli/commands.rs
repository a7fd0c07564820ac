//! Command handlers: runtime assembly, daemon control, status, and the
//! live subscription stream.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cli::output::{
    base_table, header_cell, job_progress_bar, output, truncate_text, CommandOutput,
};
use crate::domain::models::config::{Config, TransportKind};
use crate::domain::models::event::{EventData, EventKind, ProgressEvent};
use crate::domain::ports::oracle::LanguageOracle;
use crate::domain::ports::worker_runtime::InlineWorkerRuntime;
use crate::infrastructure::config::{ConfigLoader, ConfigRegistry};
use crate::infrastructure::logging;
use crate::infrastructure::oracle::HttpOracle;
use crate::infrastructure::persist::SessionStore;
use crate::infrastructure::transport::{CommandRouter, TransportMultiplexer};
use crate::services::atomicity::AtomicityDetector;
use crate::services::decomposer::DecompositionEngine;
use crate::services::dispatcher::Dispatcher;
use crate::services::job_store::JobStore;
use crate::services::progress_bus::ProgressBus;
use crate::services::rate_limiter::LimiterSet;
use crate::services::timeout::TimeoutManager;

const PIDFILE: &str = ".vibeflow/vibeflow.pid";

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => ConfigLoader::load_from_file(path),
        None => ConfigLoader::load(),
    }
}

/// Start the runtime in the foreground and serve until interrupted.
pub async fn handle_start(
    config_path: Option<&Path>,
    workers: Option<usize>,
    attach_stdio: bool,
) -> Result<()> {
    let config = load_config(config_path)?;
    ConfigRegistry::init(config.clone())?;
    let _log_guard = logging::init(&config.logging)?;
    let registry = ConfigRegistry::get_instance();

    let shutdown = CancellationToken::new();
    let bus = Arc::new(ProgressBus::new(config.bus.clone()));
    let store = Arc::new(JobStore::new(Arc::clone(&bus), registry.clone()));

    let oracle: Arc<dyn LanguageOracle> = Arc::new(HttpOracle::new(config.oracle.clone()));
    let timeouts = TimeoutManager::with_registry(registry.clone());
    let detector = Arc::new(AtomicityDetector::new(
        Arc::clone(&oracle),
        timeouts.clone(),
        config.oracle.primary_nlp_method,
        config.limits.min_confidence,
    ));
    let engine = Arc::new(DecompositionEngine::new(
        detector,
        oracle,
        timeouts,
        config.limits.clone(),
    ));

    let sessions = config
        .persistence
        .enabled
        .then(|| Arc::new(SessionStore::new(&config.persistence.root)));

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        Arc::new(InlineWorkerRuntime::new()),
        engine,
        config.scheduler.clone(),
        registry.clone(),
        sessions,
        shutdown.clone(),
    ));
    dispatcher.ensure_default_workers(workers.unwrap_or(config.limits.max_concurrent_tasks));

    let router = Arc::new(CommandRouter::new(
        Arc::clone(&dispatcher),
        LimiterSet::new(&config.rate_limits),
    ));
    let multiplexer = Arc::new(TransportMultiplexer::new(
        config.transports.clone(),
        router,
        Arc::clone(&bus),
        config.bus.clone(),
        shutdown.clone(),
    ));

    if !multiplexer.start(attach_stdio).await {
        bail!("no transport could be started");
    }
    for transport in multiplexer.active() {
        match transport.addr {
            Some(addr) => tracing::info!(kind = transport.kind.as_str(), %addr, "serving"),
            None => tracing::info!(kind = transport.kind.as_str(), "serving"),
        }
    }

    write_pidfile().context("failed to write pidfile")?;

    {
        let bus = Arc::clone(&bus);
        let cancel = shutdown.clone();
        tokio::spawn(async move { bus.run_heartbeat_loop(cancel).await });
    }
    {
        let store = Arc::clone(&store);
        let cancel = shutdown.clone();
        tokio::spawn(async move { store.run_prune_loop(cancel).await });
    }
    {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move { dispatcher.run_liveness_loop().await });
    }

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, draining");
    shutdown.cancel();
    // Give in-flight cancellations a moment to unwind before exit.
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    remove_pidfile();
    ConfigRegistry::teardown();
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(signal) => signal,
        Err(err) => {
            tracing::error!(error = %err, "failed to install SIGTERM handler");
            let _ = ctrl_c.await;
            return;
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = sigterm.recv() => {}
    }
}

fn write_pidfile() -> Result<()> {
    let path = PathBuf::from(PIDFILE);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, std::process::id().to_string())?;
    Ok(())
}

fn remove_pidfile() {
    let _ = std::fs::remove_file(PIDFILE);
}

fn read_pidfile() -> Option<i32> {
    std::fs::read_to_string(PIDFILE)
        .ok()?
        .trim()
        .parse::<i32>()
        .ok()
}

fn process_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

#[derive(Debug, Serialize)]
struct StopReport {
    stopped: bool,
    pid: Option<i32>,
    message: String,
}

impl CommandOutput for StopReport {
    fn to_human(&self) -> String {
        self.message.clone()
    }
}

/// Signal the daemon recorded in the pidfile.
pub fn handle_stop(json: bool) -> Result<()> {
    let Some(pid) = read_pidfile() else {
        output(
            &StopReport {
                stopped: false,
                pid: None,
                message: "no pidfile found; daemon not running".to_string(),
            },
            json,
        );
        return Ok(());
    };

    if !process_alive(pid) {
        remove_pidfile();
        output(
            &StopReport {
                stopped: false,
                pid: Some(pid),
                message: format!("stale pidfile for dead process {pid}, removed"),
            },
            json,
        );
        return Ok(());
    }

    kill(Pid::from_raw(pid), Signal::SIGTERM)
        .with_context(|| format!("failed to signal process {pid}"))?;
    output(
        &StopReport {
            stopped: true,
            pid: Some(pid),
            message: format!("sent SIGTERM to {pid}"),
        },
        json,
    );
    Ok(())
}

#[derive(Debug, Serialize)]
struct SessionPlan {
    session: Uuid,
    /// Topological waves: tasks in the same wave share no path
    waves: Vec<Vec<Uuid>>,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    running: bool,
    pid: Option<i32>,
    transports: Vec<String>,
    persisted_sessions: Vec<Uuid>,
    scheduler_algorithm: String,
    max_concurrent_tasks: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    plans: Vec<SessionPlan>,
}

impl CommandOutput for StatusReport {
    fn to_human(&self) -> String {
        let mut out = String::new();
        out.push_str(&match (self.running, self.pid) {
            (true, Some(pid)) => {
                format!("daemon: {} (pid {pid})\n", console::style("running").green())
            }
            _ => format!("daemon: {}\n", console::style("not running").red()),
        });
        out.push_str(&format!(
            "scheduler: {} ({} concurrent tasks)\n",
            self.scheduler_algorithm, self.max_concurrent_tasks
        ));

        let mut table = base_table();
        table.set_header(vec![header_cell("Transport")]);
        for transport in &self.transports {
            table.add_row(vec![transport.clone()]);
        }
        out.push_str(&table.to_string());
        out.push('\n');

        if self.persisted_sessions.is_empty() {
            out.push_str("sessions: none persisted\n");
        } else {
            let mut table = base_table();
            table.set_header(vec![header_cell("Session")]);
            for id in &self.persisted_sessions {
                table.add_row(vec![truncate_text(&id.to_string(), 36)]);
            }
            out.push_str(&table.to_string());
            out.push('\n');
        }

        for plan in &self.plans {
            out.push_str(&format!("plan for session {}\n", plan.session));
            let mut table = base_table();
            table.set_header(vec![header_cell("Wave"), header_cell("Tasks")]);
            for (i, wave) in plan.waves.iter().enumerate() {
                let tasks = wave
                    .iter()
                    .map(|id| truncate_text(&id.to_string(), 8))
                    .collect::<Vec<_>>()
                    .join(", ");
                table.add_row(vec![format!("{i}"), tasks]);
            }
            out.push_str(&table.to_string());
            out.push('\n');
        }
        out
    }
}

/// Report daemon liveness, configured transports, and sessions.
pub async fn handle_status(config_path: Option<&Path>, show_plan: bool, json: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let pid = read_pidfile();
    let running = pid.map(process_alive).unwrap_or(false);

    let store = SessionStore::new(&config.persistence.root);
    let persisted_sessions = if config.persistence.enabled {
        store.list_sessions().await.unwrap_or_default()
    } else {
        Vec::new()
    };

    let mut plans = Vec::new();
    if show_plan {
        for &id in &persisted_sessions {
            match store.load_session(id).await {
                Ok(session) => plans.push(SessionPlan {
                    session: id,
                    waves: session.graph.topo_levels(),
                }),
                Err(err) => tracing::warn!(session = %id, error = %err, "unreadable session"),
            }
        }
    }

    let transports = config
        .transports
        .iter()
        .map(|t| {
            let state = if t.enabled { "enabled" } else { "disabled" };
            match t.kind {
                TransportKind::Stdio => format!("stdio ({state})"),
                kind => format!("{} {}:{} ({state})", kind.as_str(), t.host, t.port),
            }
        })
        .collect();

    output(
        &StatusReport {
            running,
            pid,
            transports,
            persisted_sessions,
            scheduler_algorithm: config.scheduler.algorithm.as_str().to_string(),
            max_concurrent_tasks: config.limits.max_concurrent_tasks,
            plans,
        },
        json,
    );
    Ok(())
}

/// Follow a job's progress over the SSE transport until it terminates.
pub async fn handle_subscribe(
    config_path: Option<&Path>,
    job_id: Uuid,
    endpoint: Option<String>,
    json: bool,
) -> Result<()> {
    let endpoint = match endpoint {
        Some(endpoint) => endpoint,
        None => {
            let config = load_config(config_path)?;
            let binding = config
                .transports
                .iter()
                .find(|t| t.kind == TransportKind::Sse && t.enabled)
                .context("no enabled sse transport configured")?;
            format!("http://{}:{}/events", binding.host, binding.port)
        }
    };
    let url = format!("{endpoint}?job={job_id}");

    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("failed to connect to {url}"))?;
    if !response.status().is_success() {
        bail!("event stream returned {}", response.status());
    }

    let bar = if json { None } else { Some(job_progress_bar()) };
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("event stream interrupted")?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(newline) = buffer.find('\n') {
            let line = buffer[..newline].trim().to_string();
            buffer.drain(..=newline);

            let Some(payload) = line.strip_prefix("data:") else {
                continue;
            };
            let Ok(event) = serde_json::from_str::<ProgressEvent>(payload.trim()) else {
                continue;
            };

            if json {
                println!("{}", serde_json::to_string(&event)?);
            } else if let Some(bar) = &bar {
                render_event(bar, &event);
            }

            if let EventData::Job(progress) = &event.data {
                if progress.status.is_terminal() {
                    if let Some(bar) = &bar {
                        bar.finish_with_message(progress.status.as_str().to_string());
                    }
                    if event.event == EventKind::JobFailed {
                        let detail = progress
                            .error
                            .as_ref()
                            .map(|e| e.message.clone())
                            .unwrap_or_else(|| "unknown error".to_string());
                        bail!("job failed: {detail}");
                    }
                    return Ok(());
                }
            }
        }
    }

    bail!("event stream closed before the job reached a terminal status")
}

fn render_event(bar: &indicatif::ProgressBar, event: &ProgressEvent) {
    match &event.data {
        EventData::Job(progress) => {
            bar.set_position(u64::from(progress.progress));
            if let Some(message) = &progress.message {
                bar.set_message(message.clone());
            }
            if let Some(warning) = &progress.warning {
                bar.println(format!("warning: {warning}"));
            }
        }
        EventData::Task(task) => {
            let label = match event.event {
                EventKind::TaskAssigned => "assigned",
                EventKind::TaskCompleted => "completed",
                EventKind::TaskFailed => "failed",
                _ => return,
            };
            bar.println(format!("task {} {label}", task.task_id));
        }
        EventData::Heartbeat(_) => {}
    }
}
