//! C5: decides whether an agent reply is a valid completion signal for the
//! current dispatch.
//!
//! A pure function over owned inputs (INV-3) — no store or clock access is
//! baked in, mirroring the teacher's `AtomicTaskStateManager` guard checks
//! (`atomic_state.rs`) being plain state comparisons rather than I/O. The
//! marker detector is a single `regex::Regex` built once, the way the
//! teacher's `TaskContentValidator` (`validation.rs`) precompiles its
//! patterns in `new()` instead of per call.

use crate::models::Task;
use chrono::{DateTime, Utc};
use once_cell_like::OnceRegex;
use regex::Regex;

/// Tiny lazy-once cell so the marker regex is compiled exactly once per
/// process without pulling in `once_cell` for a single use site.
mod once_cell_like {
    use regex::Regex;
    use std::sync::OnceLock;

    pub struct OnceRegex(OnceLock<Regex>, &'static str);

    impl OnceRegex {
        pub const fn new(pattern: &'static str) -> Self {
            Self(OnceLock::new(), pattern)
        }

        pub fn get(&self) -> &Regex {
            self.0.get_or_init(|| Regex::new(self.1).expect("valid marker regex"))
        }
    }
}

static MARKER_REGEX: OnceRegex = OnceRegex::new(
    r"(?i)task_complete(?:\s+dispatch_id=([a-z0-9-]+))?(?:[:\-]|\s|$)",
);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkerDetection {
    pub has_completion_marker: bool,
    pub extracted_dispatch_id: Option<String>,
}

/// Scans a plain-text reply for the `TASK_COMPLETE` sentinel (§4.5).
pub fn detect_marker(text: &str) -> MarkerDetection {
    match MARKER_REGEX.get().captures(text) {
        Some(caps) => MarkerDetection {
            has_completion_marker: true,
            extracted_dispatch_id: caps.get(1).map(|m| m.as_str().to_string()),
        },
        None => MarkerDetection::default(),
    }
}

/// Words whose presence alongside the absence of a formal marker still makes
/// a reply worth logging (§4.7's "plausible completion signal" check;
/// shared here so the gate and the monitor agree on the wordlist).
pub fn has_plausible_completion_language(text: &str) -> bool {
    let lower = text.to_lowercase();
    crate::constants::COMPLETION_EVIDENCE_WORDS
        .iter()
        .any(|w| lower.contains(w))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    Accepted,
    RejectedMissingDispatchContext,
    RejectedStaleDispatchId,
    RejectedStaleEvidenceTimestamp,
    RejectedSuspiciousInstantNoNewEvidence,
    RejectedMissingCompletionMarker,
}

impl CompletionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CompletionReason::Accepted => "accepted",
            CompletionReason::RejectedMissingDispatchContext => "rejected_missing_dispatch_context",
            CompletionReason::RejectedStaleDispatchId => "rejected_stale_dispatch_id",
            CompletionReason::RejectedStaleEvidenceTimestamp => "rejected_stale_evidence_timestamp",
            CompletionReason::RejectedSuspiciousInstantNoNewEvidence => {
                "rejected_suspicious_instant_no_new_evidence"
            }
            CompletionReason::RejectedMissingCompletionMarker => "rejected_missing_completion_marker",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionDecision {
    pub accepted: bool,
    pub completion_reason: CompletionReason,
    pub dispatch_id: Option<String>,
    pub payload_dispatch_id: Option<String>,
    pub evidence_timestamp: Option<DateTime<Utc>>,
}

/// Input bundle for `evaluate` (§4.5's `{payloadDispatchId?, hasCompletionMarker?,
/// evidenceTimestamp?, assistantMessageCount, nowIso?}`).
#[derive(Debug, Clone)]
pub struct CompletionInput {
    pub payload_dispatch_id: Option<String>,
    pub has_completion_marker: bool,
    pub evidence_timestamp: Option<DateTime<Utc>>,
    pub assistant_message_count: u32,
    pub now: DateTime<Utc>,
}

fn reject(
    reason: CompletionReason,
    dispatch_id: Option<String>,
    payload_dispatch_id: Option<String>,
    evidence_timestamp: Option<DateTime<Utc>>,
) -> CompletionDecision {
    CompletionDecision {
        accepted: false,
        completion_reason: reason,
        dispatch_id,
        payload_dispatch_id,
        evidence_timestamp,
    }
}

/// §4.5's six-step algorithm. Pure: identical `(task, input)` always yields
/// an identical `CompletionDecision` (INV-3).
pub fn evaluate(task: &Task, input: &CompletionInput) -> CompletionDecision {
    let (Some(dispatch_id), Some(dispatch_started_at)) =
        (task.dispatch_id.clone(), task.dispatch_started_at)
    else {
        return reject(
            CompletionReason::RejectedMissingDispatchContext,
            task.dispatch_id.clone(),
            input.payload_dispatch_id.clone(),
            input.evidence_timestamp,
        );
    };

    let effective_payload_id = match &input.payload_dispatch_id {
        Some(id) => Some(id.clone()),
        None if input.has_completion_marker => Some(dispatch_id.clone()),
        None => None,
    };

    let Some(effective_payload_id) = effective_payload_id else {
        return reject(
            CompletionReason::RejectedMissingCompletionMarker,
            Some(dispatch_id),
            input.payload_dispatch_id.clone(),
            input.evidence_timestamp,
        );
    };

    if effective_payload_id != dispatch_id {
        return reject(
            CompletionReason::RejectedStaleDispatchId,
            Some(dispatch_id),
            Some(effective_payload_id),
            input.evidence_timestamp,
        );
    }

    if let Some(evidence) = input.evidence_timestamp {
        if evidence < dispatch_started_at {
            return reject(
                CompletionReason::RejectedStaleEvidenceTimestamp,
                Some(dispatch_id),
                Some(effective_payload_id),
                input.evidence_timestamp,
            );
        }
    }

    let new_evidence = input
        .assistant_message_count
        .saturating_sub(task.dispatch_message_count_start);
    let age = input.now.signed_duration_since(dispatch_started_at);
    let guard_window = chrono::Duration::from_std(crate::constants::ANTI_INSTANT_GUARD)
        .unwrap_or_else(|_| chrono::Duration::seconds(5));
    if new_evidence == 0 && age < guard_window {
        return reject(
            CompletionReason::RejectedSuspiciousInstantNoNewEvidence,
            Some(dispatch_id),
            Some(effective_payload_id),
            input.evidence_timestamp,
        );
    }

    CompletionDecision {
        accepted: true,
        completion_reason: CompletionReason::Accepted,
        dispatch_id: Some(dispatch_id),
        payload_dispatch_id: Some(effective_payload_id),
        evidence_timestamp: input.evidence_timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Priority, Task};
    use chrono::Duration;

    fn dispatched_task(dispatch_id: &str, started_at: DateTime<Utc>, baseline: u32) -> Task {
        let mut t = Task::new("t".into(), None, Priority::Low);
        t.dispatch_id = Some(dispatch_id.to_string());
        t.dispatch_started_at = Some(started_at);
        t.dispatch_message_count_start = baseline;
        t
    }

    #[test]
    fn detects_marker_with_dispatch_id() {
        let d = detect_marker("work is done. TASK_COMPLETE dispatch_id=abc-123: all good");
        assert!(d.has_completion_marker);
        assert_eq!(d.extracted_dispatch_id.as_deref(), Some("abc-123"));
    }

    #[test]
    fn detects_marker_without_dispatch_id() {
        let d = detect_marker("TASK_COMPLETE: done");
        assert!(d.has_completion_marker);
        assert!(d.extracted_dispatch_id.is_none());
    }

    #[test]
    fn no_marker_in_plain_reply() {
        let d = detect_marker("working on it still");
        assert!(!d.has_completion_marker);
    }

    // BND-1
    #[test]
    fn missing_dispatch_context_is_rejected() {
        let task = Task::new("t".into(), None, Priority::Low);
        let now = Utc::now();
        let decision = evaluate(
            &task,
            &CompletionInput {
                payload_dispatch_id: Some("d1".into()),
                has_completion_marker: true,
                evidence_timestamp: Some(now),
                assistant_message_count: 5,
                now,
            },
        );
        assert!(!decision.accepted);
        assert_eq!(
            decision.completion_reason,
            CompletionReason::RejectedMissingDispatchContext
        );
    }

    // BND-2
    #[test]
    fn stale_dispatch_id_is_rejected_even_with_marker() {
        let now = Utc::now();
        let task = dispatched_task("d-current", now - Duration::seconds(60), 0);
        let decision = evaluate(
            &task,
            &CompletionInput {
                payload_dispatch_id: Some("d-old".into()),
                has_completion_marker: true,
                evidence_timestamp: Some(now),
                assistant_message_count: 2,
                now,
            },
        );
        assert!(!decision.accepted);
        assert_eq!(decision.completion_reason, CompletionReason::RejectedStaleDispatchId);
    }

    // BND-3
    #[test]
    fn instant_spoof_with_no_new_evidence_is_rejected() {
        let now = Utc::now();
        let task = dispatched_task("d1", now - Duration::seconds(1), 3);
        let decision = evaluate(
            &task,
            &CompletionInput {
                payload_dispatch_id: Some("d1".into()),
                has_completion_marker: true,
                evidence_timestamp: Some(now),
                assistant_message_count: 3,
                now,
            },
        );
        assert!(!decision.accepted);
        assert_eq!(
            decision.completion_reason,
            CompletionReason::RejectedSuspiciousInstantNoNewEvidence
        );
    }

    // BND-4
    #[test]
    fn stale_evidence_timestamp_is_rejected() {
        let now = Utc::now();
        let started = now - Duration::seconds(60);
        let task = dispatched_task("d1", started, 0);
        let decision = evaluate(
            &task,
            &CompletionInput {
                payload_dispatch_id: Some("d1".into()),
                has_completion_marker: true,
                evidence_timestamp: Some(started - Duration::seconds(5)),
                assistant_message_count: 1,
                now,
            },
        );
        assert!(!decision.accepted);
        assert_eq!(
            decision.completion_reason,
            CompletionReason::RejectedStaleEvidenceTimestamp
        );
    }

    #[test]
    fn accepted_when_fresh_with_new_evidence() {
        let now = Utc::now();
        let started = now - Duration::seconds(30);
        let task = dispatched_task("d1", started, 1);
        let decision = evaluate(
            &task,
            &CompletionInput {
                payload_dispatch_id: None,
                has_completion_marker: true,
                evidence_timestamp: Some(now),
                assistant_message_count: 3,
                now,
            },
        );
        assert!(decision.accepted);
        assert_eq!(decision.completion_reason, CompletionReason::Accepted);
        assert_eq!(decision.payload_dispatch_id.as_deref(), Some("d1"));
    }

    #[test]
    fn missing_marker_and_missing_payload_id_is_rejected() {
        let now = Utc::now();
        let task = dispatched_task("d1", now - Duration::seconds(60), 0);
        let decision = evaluate(
            &task,
            &CompletionInput {
                payload_dispatch_id: None,
                has_completion_marker: false,
                evidence_timestamp: Some(now),
                assistant_message_count: 2,
                now,
            },
        );
        assert!(!decision.accepted);
        assert_eq!(
            decision.completion_reason,
            CompletionReason::RejectedMissingCompletionMarker
        );
    }

    /// INV-3: purity — identical inputs yield identical decisions.
    #[test]
    fn evaluate_is_pure() {
        let now = Utc::now();
        let task = dispatched_task("d1", now - Duration::seconds(30), 1);
        let input = CompletionInput {
            payload_dispatch_id: Some("d1".into()),
            has_completion_marker: true,
            evidence_timestamp: Some(now),
            assistant_message_count: 4,
            now,
        };
        let a = evaluate(&task, &input);
        let b = evaluate(&task, &input);
        assert_eq!(a.accepted, b.accepted);
        assert_eq!(a.completion_reason, b.completion_reason);
    }
}
