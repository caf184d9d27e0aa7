//! Application root. Owns every shared, process-lifetime component and wires
//! them together by `Arc` reference — per §9's design note, there is no
//! module-level mutability (`lazy_static`/global `OnceCell`) anywhere in this
//! crate; `MissionControl` is the single place that constructs and holds it
//! all, mirroring the way the teacher's `main.rs` builds one
//! `AgentOrchestrator` and hands clones of its `Arc` fields to the API layer.

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::events::EventBus;
use crate::gateway::{GatewayAdapter, HttpGatewayAdapter};
use crate::monitor::MonitorRegistry;
use crate::orchestrator::{Handoff, NoopTestTrigger, OrchestratorRouter};
use crate::planning::PlanningController;
use crate::reconciler::{GatewaySessionEvidence, Reconciler};
use crate::state_machine::StateMachine;
use crate::store::{InMemoryStore, Store};
use std::sync::Arc;

#[derive(Clone)]
pub struct MissionControl {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub events: EventBus,
    pub gateway: Arc<dyn GatewayAdapter>,
    pub state_machine: Arc<StateMachine>,
    pub monitors: Arc<MonitorRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub orchestrator: Arc<OrchestratorRouter>,
    pub reconciler: Arc<Reconciler>,
    pub planning: Arc<PlanningController>,
}

impl MissionControl {
    pub fn new(config: Config) -> Self {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let events = EventBus::new();
        let gateway: Arc<dyn GatewayAdapter> = Arc::new(HttpGatewayAdapter::new(config.gateway.base_url.clone()));
        let state_machine = Arc::new(StateMachine::new(store.clone(), events.clone()));
        let monitors = MonitorRegistry::new(store.clone(), gateway.clone(), state_machine.clone(), events.clone());

        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            gateway.clone(),
            state_machine.clone(),
            monitors.clone(),
            events.clone(),
            config.gateway.namespace.clone(),
        ));

        let orchestrator = Arc::new(OrchestratorRouter::new(
            store.clone(),
            gateway.clone(),
            state_machine.clone(),
            dispatcher.clone(),
            monitors.clone(),
            config.gateway.namespace.clone(),
        ));

        let handoff = Arc::new(Handoff::new(
            store.clone(),
            state_machine.clone(),
            orchestrator.clone(),
            Arc::new(NoopTestTrigger),
        ));
        monitors.set_handoff(handoff);

        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            state_machine.clone(),
            Arc::new(GatewaySessionEvidence::new(gateway.clone())),
        ));

        let planning = Arc::new(PlanningController::new(
            store.clone(),
            gateway.clone(),
            state_machine.clone(),
            dispatcher.clone(),
            orchestrator.clone(),
            config.gateway.namespace.clone(),
        ));

        Self {
            config,
            store,
            events,
            gateway,
            state_machine,
            monitors,
            dispatcher,
            orchestrator,
            reconciler,
            planning,
        }
    }

    /// Starts the background reconciliation loop (`POST /tasks/reconcile`'s
    /// unattended counterpart). Runs for the lifetime of the process; cancel
    /// by dropping the returned handle.
    pub fn spawn_reconciler_loop(&self) -> tokio::task::JoinHandle<()> {
        let reconciler = self.reconciler.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(crate::constants::ORCHESTRATOR_POLL_INTERVAL * 10);
            loop {
                ticker.tick().await;
                if let Err(err) = reconciler.reconcile().await {
                    tracing::warn!(error = %err, "reconciler pass failed");
                }
            }
        })
    }
}
