use std::sync::Arc;

use crate::audit::SharedAudit;
use crate::config::ControlConfig;
use crate::hub::HubRegistry;
use crate::ledger::{AgentLocks, SharedLedger};
use crate::lifecycle::Lifecycle;
use crate::reconcile::{ReconcilePoller, Reconciler};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ControlConfig>,
    pub ledger: SharedLedger,
    pub hubs: HubRegistry,
    pub lifecycle: Lifecycle,
    pub reconciler: Reconciler,
    pub audit: SharedAudit,
}

impl AppState {
    pub fn new(config: ControlConfig, ledger: SharedLedger, audit: SharedAudit) -> Self {
        let config = Arc::new(config);
        let locks = AgentLocks::new();
        let hubs = HubRegistry::new(ledger.clone(), config.log_buffer_lines);
        let lifecycle = Lifecycle::new(ledger.clone(), hubs.clone(), locks.clone(), config.clone());
        let reconciler = Reconciler::new(
            ledger.clone(),
            locks,
            config.intent_grace,
            config.provision_timeout,
        );
        Self {
            config,
            ledger,
            hubs,
            lifecycle,
            reconciler,
            audit,
        }
    }

    /// None when periodic sync is disabled.
    pub fn poller(&self) -> Option<ReconcilePoller> {
        let interval = self.config.sync_interval?;
        Some(ReconcilePoller::new(
            self.reconciler.clone(),
            self.hubs.clone(),
            interval,
            self.config.request_timeout,
        ))
    }
}
