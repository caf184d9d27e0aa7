//! System-wide timing and sizing knobs for the task lifecycle engine.

use std::time::Duration;

/// Monitor poll cadence (§4.7).
pub const POLL_INTERVAL_MS: u64 = 10_000;

/// Monitor idle timeout before a "re-dispatch/rework" nudge comment (§4.7).
pub const IDLE_TIMEOUT_MS: u64 = 600_000;

/// Default first-activity ack timeout; overridable via `MC_FIRST_ACTIVITY_ACK_TIMEOUT_MS`.
pub const DEFAULT_FIRST_ACTIVITY_ACK_TIMEOUT_MS: u64 = 90_000;

/// Anti-instant guard window for the Completion Gate (§4.5 step 5).
pub const ANTI_INSTANT_GUARD: Duration = Duration::from_secs(5);

/// Orchestrator poll cadence and overall deadline (§4.8).
pub const ORCHESTRATOR_POLL_INTERVAL: Duration = Duration::from_secs(3);
pub const ORCHESTRATOR_TIMEOUT: Duration = Duration::from_secs(90);

/// Upper bound on `WorkflowSettings.max_rework_cycles` (§3).
pub const MAX_REWORK_CYCLES_CEILING: u32 = 10;

/// "Substantive completion" heuristic threshold used only for check-completion
/// log suppression (§9 Open Questions — intentionally not used by the gate itself).
pub const SUBSTANTIVE_COMPLETION_MIN_LENGTH: usize = 120;

pub const COMPLETION_EVIDENCE_WORDS: &[&str] = &["done", "completed", "implemented", "finished"];

pub fn first_activity_ack_timeout_ms() -> u64 {
    std::env::var("MC_FIRST_ACTIVITY_ACK_TIMEOUT_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_FIRST_ACTIVITY_ACK_TIMEOUT_MS)
}
