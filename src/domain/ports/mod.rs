//! Ports: the traits through which the runtime talks to the outside.

pub mod event_sink;
pub mod oracle;
pub mod worker_runtime;

pub use event_sink::{ChannelSink, EventSink, SinkSendResult};
pub use oracle::{LanguageOracle, OracleQueryKind, ScriptedOracle};
pub use worker_runtime::{InlineWorkerRuntime, TaskOutcome, WorkerRuntime};
