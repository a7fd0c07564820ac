//! Orchestration services.

pub mod atomicity;
pub mod decomposer;
pub mod dispatcher;
pub mod job_store;
pub mod progress_bus;
pub mod rate_limiter;
pub mod scheduler;
pub mod timeout;

pub use atomicity::{AtomicityDetector, AtomicityVerdict, ProjectContext};
pub use decomposer::DecompositionEngine;
pub use dispatcher::Dispatcher;
pub use job_store::JobStore;
pub use progress_bus::ProgressBus;
pub use rate_limiter::{LimiterSet, RateDecision, SlidingWindowLimiter};
pub use scheduler::{Assignment, Schedule, Scheduler};
pub use timeout::{RunOutcome, RunOverrides, TimeoutManager};

/// Extract a JSON object from oracle output.
///
/// Handles markdown code fences and objects embedded in prose; returns
/// the input trimmed when nothing better is found, leaving the parse
/// error to the caller.
pub fn extract_json_from_response(response: &str) -> String {
    let trimmed = response.trim();

    // Handle ```json ... ``` blocks
    if trimmed.starts_with("```json") {
        if let Some(end) = trimmed.rfind("```") {
            if end > 7 {
                return trimmed[7..end].trim().to_string();
            }
        }
    }

    // Handle ``` ... ``` blocks
    if trimmed.starts_with("```") {
        if let Some(end) = trimmed.rfind("```") {
            let start = if trimmed.starts_with("```\n") { 4 } else { 3 };
            if end > start {
                return trimmed[start..end].trim().to_string();
            }
        }
    }

    // If it already looks like a JSON object, use it directly
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return trimmed.to_string();
    }

    // Try to find a JSON object embedded in text
    if let Some(start) = trimmed.find('{') {
        if let Some(end) = trimmed.rfind('}') {
            if end > start {
                return trimmed[start..=end].to_string();
            }
        }
    }

    trimmed.to_string()
}
