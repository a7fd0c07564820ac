//! Stdio transport: JSON-Lines commands on stdin, protocol messages on
//! stdout.
//!
//! Stdout carries protocol output only (command responses and
//! subscribed events); every diagnostic goes to stderr through
//! tracing. A single writer task serializes the two output sources so
//! lines never interleave.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::models::config::TransportKind;
use crate::domain::models::event::EventKind;
use crate::domain::ports::event_sink::ChannelSink;

use super::http::TransportState;
use super::{CommandRequest, CommandResponse};

/// Rate-limiter key for the local stdio client.
const STDIO_CLIENT_KEY: &str = "stdio";

/// Drive the stdio protocol until stdin closes or shutdown fires.
pub async fn run(state: TransportState, cancel: CancellationToken) {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    let writer_cancel = cancel.clone();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        loop {
            tokio::select! {
                () = writer_cancel.cancelled() => break,
                line = out_rx.recv() => {
                    let Some(line) = line else { break };
                    if stdout.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                    if stdout.write_all(b"\n").await.is_err() {
                        break;
                    }
                    let _ = stdout.flush().await;
                }
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        handle_line(&state, &line, &out_tx, &cancel);
                    }
                    Ok(None) => {
                        tracing::info!("stdin closed, stdio transport ending");
                        break;
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "stdin read failed");
                        break;
                    }
                }
            }
        }
    }

    drop(out_tx);
    let _ = writer.await;
}

/// Handle one protocol line, queueing any output on `out_tx`.
pub(crate) fn handle_line(
    state: &TransportState,
    line: &str,
    out_tx: &mpsc::UnboundedSender<String>,
    cancel: &CancellationToken,
) {
    let request = match serde_json::from_str::<CommandRequest>(line.trim()) {
        Ok(request) => request,
        Err(err) => {
            send_json(
                out_tx,
                &CommandResponse::error("validation", format!("unparseable command: {err}")),
            );
            return;
        }
    };

    match request {
        CommandRequest::Subscribe { filter } => {
            let (sink, mut rx) = ChannelSink::bounded(state.bus_config.buffer_capacity);
            let subscriber_id = state
                .bus
                .subscribe(TransportKind::Stdio, filter, Box::new(sink));

            let bus = std::sync::Arc::clone(&state.bus);
            let forward_tx = out_tx.clone();
            let forward_cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = forward_cancel.cancelled() => break,
                        event = rx.recv() => {
                            let Some(event) = event else { break };
                            // Writing into the local pipe is the ACK.
                            if event.event == EventKind::Heartbeat {
                                bus.ack(subscriber_id);
                            }
                            let Ok(line) = serde_json::to_string(&event) else { continue };
                            if forward_tx.send(line).is_err() {
                                break;
                            }
                        }
                    }
                }
                bus.unsubscribe(subscriber_id);
            });
            send_json(out_tx, &CommandResponse::ok());
        }
        other => {
            let response = state.router.handle(STDIO_CLIENT_KEY, &other);
            send_json(out_tx, &response);
        }
    }
}

fn send_json(out_tx: &mpsc::UnboundedSender<String>, response: &CommandResponse) {
    if let Ok(line) = serde_json::to_string(response) {
        let _ = out_tx.send(line);
    }
}
