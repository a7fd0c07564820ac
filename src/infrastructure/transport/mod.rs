//! Transport multiplexer: binds the configured listeners and routes
//! commands in and events out.
//!
//! Startup is tolerant: a transport that fails to bind (even after the
//! port scan) is logged and skipped, the rest keep serving. The stdio
//! transport needs no socket and always succeeds, so a runtime with
//! every port taken still has a control channel.

pub mod http;
pub mod stdio;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::models::config::{BusConfig, TransportBinding, TransportKind};
use crate::domain::models::event::SubscriptionFilter;
use crate::domain::models::task::TaskSpec;
use crate::services::dispatcher::Dispatcher;
use crate::services::progress_bus::ProgressBus;
use crate::services::rate_limiter::LimiterSet;

/// Self-describing command accepted on every ingress channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum CommandRequest {
    #[serde(rename_all = "camelCase")]
    CreateJob { task_spec: TaskSpec },
    #[serde(rename_all = "camelCase")]
    CancelJob { job_id: Uuid },
    #[serde(rename_all = "camelCase")]
    PauseJob { job_id: Uuid },
    #[serde(rename_all = "camelCase")]
    ResumeJob { job_id: Uuid },
    Subscribe { filter: SubscriptionFilter },
}

/// Uniform command reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Seconds to wait when rate-limited (the 429-equivalent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl CommandResponse {
    pub fn ok() -> Self {
        Self {
            ok: true,
            ..Self::default()
        }
    }

    pub fn job(job_id: Uuid) -> Self {
        Self {
            ok: true,
            job_id: Some(job_id),
            ..Self::default()
        }
    }

    pub fn error(kind: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error_kind: Some(kind.to_string()),
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn rate_limited(retry_after: u64) -> Self {
        Self {
            ok: false,
            error_kind: Some("rate_limit".to_string()),
            error: Some("rate limit exceeded".to_string()),
            retry_after: Some(retry_after),
            ..Self::default()
        }
    }
}

/// Routes ingress commands to the dispatcher behind the rate limiters.
pub struct CommandRouter {
    dispatcher: Arc<Dispatcher>,
    limiters: LimiterSet,
}

impl CommandRouter {
    pub fn new(dispatcher: Arc<Dispatcher>, limiters: LimiterSet) -> Self {
        Self {
            dispatcher,
            limiters,
        }
    }

    /// Handle a non-subscribe command from a client identified by `key`
    /// (IP or token). Subscribe is transport-specific and handled where
    /// the sink lives.
    pub fn handle(&self, key: &str, request: &CommandRequest) -> CommandResponse {
        let decision = match request {
            CommandRequest::CreateJob { .. } => self.limiters.task_start.allow(key),
            _ => self.limiters.api.allow(key),
        };
        if !decision.allowed {
            return CommandResponse::rate_limited(decision.retry_after_secs);
        }

        match request {
            CommandRequest::CreateJob { task_spec } => {
                match Arc::clone(&self.dispatcher).create_job(task_spec.clone()) {
                    Ok(job_id) => CommandResponse::job(job_id),
                    Err(err) => CommandResponse::error(err.kind(), err.to_string()),
                }
            }
            CommandRequest::CancelJob { job_id } => match self.dispatcher.cancel_job(*job_id) {
                Ok(()) => CommandResponse::ok(),
                Err(err) => CommandResponse::error(err.kind(), err.to_string()),
            },
            CommandRequest::PauseJob { job_id } => match self.dispatcher.pause_job(*job_id) {
                Ok(()) => CommandResponse::ok(),
                Err(err) => CommandResponse::error(err.kind(), err.to_string()),
            },
            CommandRequest::ResumeJob { job_id } => match self.dispatcher.resume_job(*job_id) {
                Ok(()) => CommandResponse::ok(),
                Err(err) => CommandResponse::error(err.kind(), err.to_string()),
            },
            CommandRequest::Subscribe { .. } => CommandResponse::error(
                "validation",
                "subscribe is handled by the transport, not the command router",
            ),
        }
    }

    /// Dispatcher accessor for transports needing direct reads.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }
}

/// A transport that actually came up.
#[derive(Debug, Clone)]
pub struct ActiveTransport {
    pub kind: TransportKind,
    pub addr: Option<SocketAddr>,
}

/// Binds the configured transports and tracks what is serving.
pub struct TransportMultiplexer {
    bindings: Vec<TransportBinding>,
    router: Arc<CommandRouter>,
    bus: Arc<ProgressBus>,
    bus_config: BusConfig,
    active: Mutex<Vec<ActiveTransport>>,
    shutdown: CancellationToken,
}

impl TransportMultiplexer {
    pub fn new(
        bindings: Vec<TransportBinding>,
        router: Arc<CommandRouter>,
        bus: Arc<ProgressBus>,
        bus_config: BusConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            bindings,
            router,
            bus,
            bus_config,
            active: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    /// Bind every enabled transport. Returns whether anything serves.
    ///
    /// `attach_stdio` controls whether the stdio loop takes over this
    /// process's stdin/stdout (daemon foreground mode).
    pub async fn start(&self, attach_stdio: bool) -> bool {
        for binding in &self.bindings {
            if !binding.enabled {
                tracing::info!(kind = binding.kind.as_str(), "transport disabled, skipping");
                continue;
            }
            match binding.kind {
                TransportKind::Stdio => {
                    if attach_stdio {
                        let state = http::TransportState {
                            router: Arc::clone(&self.router),
                            bus: Arc::clone(&self.bus),
                            bus_config: self.bus_config.clone(),
                        };
                        let cancel = self.shutdown.clone();
                        tokio::spawn(async move {
                            stdio::run(state, cancel).await;
                        });
                    }
                    self.record(ActiveTransport {
                        kind: TransportKind::Stdio,
                        addr: None,
                    });
                }
                TransportKind::Sse | TransportKind::Websocket => {
                    match self.start_http(binding).await {
                        Some(addr) => self.record(ActiveTransport {
                            kind: binding.kind,
                            addr: Some(addr),
                        }),
                        None => {
                            tracing::error!(
                                kind = binding.kind.as_str(),
                                port = binding.port,
                                scan = binding.port_scan_range,
                                "transport failed to bind, continuing without it"
                            );
                        }
                    }
                }
            }
        }
        self.is_started()
    }

    async fn start_http(&self, binding: &TransportBinding) -> Option<SocketAddr> {
        let listener = bind_with_scan(&binding.host, binding.port, binding.port_scan_range).await?;
        let addr = listener.local_addr().ok()?;

        let state = http::TransportState {
            router: Arc::clone(&self.router),
            bus: Arc::clone(&self.bus),
            bus_config: self.bus_config.clone(),
        };
        let app = http::build_app(binding.kind, state);
        let cancel = self.shutdown.clone();
        tokio::spawn(async move {
            let service =
                app.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(err) = axum::serve(listener, service)
                .with_graceful_shutdown(cancel.cancelled_owned())
                .await
            {
                tracing::error!(error = %err, "transport server exited");
            }
        });

        tracing::info!(kind = binding.kind.as_str(), addr = %addr, "transport listening");
        Some(addr)
    }

    fn record(&self, transport: ActiveTransport) {
        self.active
            .lock()
            .expect("multiplexer lock poisoned")
            .push(transport);
    }

    pub fn active(&self) -> Vec<ActiveTransport> {
        self.active
            .lock()
            .expect("multiplexer lock poisoned")
            .clone()
    }

    pub fn is_started(&self) -> bool {
        !self
            .active
            .lock()
            .expect("multiplexer lock poisoned")
            .is_empty()
    }
}

/// Bind the preferred port or the first free one in the scan range.
/// Port 0 delegates the choice to the OS.
pub async fn bind_with_scan(
    host: &str,
    preferred: u16,
    scan_range: u16,
) -> Option<tokio::net::TcpListener> {
    if preferred == 0 {
        return tokio::net::TcpListener::bind((host, 0)).await.ok();
    }
    for offset in 0..=scan_range {
        let Some(port) = preferred.checked_add(offset) else {
            break;
        };
        match tokio::net::TcpListener::bind((host, port)).await {
            Ok(listener) => {
                if offset > 0 {
                    tracing::warn!(
                        preferred,
                        chosen = port,
                        "preferred port in use, scanned forward"
                    );
                }
                return Some(listener);
            }
            Err(err) => {
                tracing::debug!(port, error = %err, "port unavailable");
            }
        }
    }
    None
}
