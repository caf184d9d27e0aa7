//! # Mission Control
//!
//! Mission Control is a task lifecycle engine: it tracks work items through a
//! guarded state graph (inbox -> planning -> assigned -> in progress ->
//! testing -> review -> done), dispatches them to autonomous coding agents
//! over a chat gateway, and reconciles recorded status against what the
//! agent's session actually shows happened.
//!
//! ## Architecture
//!
//! - **Store (C1)**: the transactional record of tasks, comments,
//!   deliverables, activity and sessions.
//! - **Event Bus (C2)**: lossy fan-out of lifecycle events to subscribers.
//! - **Gateway Adapter (C3)**: the HTTP client for the external chat gateway
//!   agents are dispatched through.
//! - **State Machine (C4)**: the only component permitted to change a task's
//!   status; every write pairs a guard check with an activity entry.
//! - **Completion Gate (C5)**: a pure function deciding whether an agent's
//!   reply counts as a genuine completion.
//! - **Dispatcher (C6)**: claims a dispatch slot atomically and sends an
//!   agent its task.
//! - **Agent Task Monitor (C7)**: polls a dispatched session for activity and
//!   completion evidence.
//! - **Orchestrator Router (C8)**: delegates phase-transition decisions to a
//!   configured orchestrator agent.
//! - **Reconciler (C9)**: corrects status drift against observed session
//!   evidence.
//! - **Planning Controller (C10)**: the question/answer loop that produces a
//!   spec before dispatch.
//!
//! `app::MissionControl` owns one `Arc`-shared instance of each component;
//! `api::ApiServer` is the only thing that talks to it from outside the
//! process.

/// HTTP API server and endpoints.
pub mod api;
/// Application root wiring every component together.
pub mod app;
/// Authentication and authorization.
pub mod auth;
/// C5: pure completion-acceptance decision.
pub mod completion_gate;
/// System configuration.
pub mod config;
/// System-wide constants.
pub mod constants;
/// C6: dispatches tasks to agents.
pub mod dispatcher;
/// Error types and handling.
pub mod error;
/// C2: lifecycle event fan-out.
pub mod events;
/// C3: chat gateway HTTP client.
pub mod gateway;
/// Best-effort JSON extraction from agent/orchestrator replies.
pub mod json_extract;
/// Core data models.
pub mod models;
/// C7: polls dispatched sessions for activity and completion.
pub mod monitor;
/// C8: orchestrator-driven phase routing.
pub mod orchestrator;
/// C10: planning question/answer loop.
pub mod planning;
/// Rate limiting functionality.
pub mod rate_limit;
/// C9: status drift correction.
pub mod reconciler;
/// C4: guarded status transitions.
pub mod state_machine;
/// C1: transactional task/activity/comment/deliverable/session records.
pub mod store;
/// Input validation and sanitization.
pub mod validation;

pub use error::{Result, SpiralError};
