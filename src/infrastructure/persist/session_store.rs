//! File-backed session persistence.
//!
//! One directory per session: `definition.json` (the session and its
//! atomic tasks), `graph.json` (nodes and edges), and `events.log`
//! (append-only JSON-Lines of state transitions). Readers tolerate
//! unknown fields and skip corrupt log lines rather than failing a
//! whole replay.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::{OrchestratorError, OrchestratorResult};
use crate::domain::models::event::ProgressEvent;
use crate::domain::models::graph::DependencyGraph;
use crate::domain::models::session::{DecompositionSession, RichResults};
use crate::domain::models::task::{AtomicTask, TaskSpec};

/// The session half of the on-disk layout (everything but the graph).
#[derive(Debug, Serialize, Deserialize)]
struct SessionDefinition {
    id: Uuid,
    root: TaskSpec,
    atomic_tasks: Vec<AtomicTask>,
    #[serde(default)]
    rich_results: RichResults,
}

/// Writer/loader for the per-session directory layout.
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn session_dir(&self, id: Uuid) -> PathBuf {
        self.root.join(id.to_string())
    }

    /// Write `definition.json` and `graph.json` for a session.
    pub async fn save_session(&self, session: &DecompositionSession) -> OrchestratorResult<()> {
        let dir = self.session_dir(session.id);
        tokio::fs::create_dir_all(&dir).await?;

        let definition = SessionDefinition {
            id: session.id,
            root: session.root.clone(),
            atomic_tasks: session.atomic_tasks.clone(),
            rich_results: session.rich_results.clone(),
        };
        let definition_json = serde_json::to_vec_pretty(&definition)?;
        tokio::fs::write(dir.join("definition.json"), definition_json).await?;

        let graph_json = serde_json::to_vec_pretty(&session.graph)?;
        tokio::fs::write(dir.join("graph.json"), graph_json).await?;

        tracing::debug!(session = %session.id, dir = %dir.display(), "session persisted");
        Ok(())
    }

    /// Load a session back from `definition.json` + `graph.json`.
    pub async fn load_session(&self, id: Uuid) -> OrchestratorResult<DecompositionSession> {
        let dir = self.session_dir(id);
        let definition_bytes = tokio::fs::read(dir.join("definition.json")).await?;
        let definition: SessionDefinition = serde_json::from_slice(&definition_bytes)?;

        let graph_bytes = tokio::fs::read(dir.join("graph.json")).await?;
        let graph: DependencyGraph = serde_json::from_slice(&graph_bytes)?;

        Ok(DecompositionSession {
            id: definition.id,
            root: definition.root,
            atomic_tasks: definition.atomic_tasks,
            graph,
            rich_results: definition.rich_results,
        })
    }

    /// Append one event to the session's `events.log`.
    pub async fn append_event(
        &self,
        session_id: Uuid,
        event: &ProgressEvent,
    ) -> OrchestratorResult<()> {
        let dir = self.session_dir(session_id);
        tokio::fs::create_dir_all(&dir).await?;
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("events.log"))
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// Read back the event log, skipping lines that no longer parse.
    pub async fn read_events(&self, session_id: Uuid) -> OrchestratorResult<Vec<ProgressEvent>> {
        let path = self.session_dir(session_id).join("events.log");
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut events = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<ProgressEvent>(line) {
                Ok(event) => events.push(event),
                Err(err) => {
                    tracing::warn!(session = %session_id, error = %err, "skipping corrupt log line");
                }
            }
        }
        Ok(events)
    }

    /// Ids of every persisted session under the root.
    pub async fn list_sessions(&self) -> OrchestratorResult<Vec<Uuid>> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| Uuid::parse_str(name).ok())
            {
                out.push(id);
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    /// Delete a persisted session directory.
    pub async fn remove_session(&self, id: Uuid) -> OrchestratorResult<()> {
        let dir = self.session_dir(id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(OrchestratorError::Io(err)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
