use std::sync::Arc;

use crate::activity::ActivityLog;
use crate::catalog::Catalog;
use crate::ledger::Ledger;
use crate::reconciler::Reconciler;
use crate::scheduler::{CronQueue, Scheduler};
use crate::supervisor::Supervisor;

/// Services shared by every handler. Each carries its own locking.
#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<Catalog>,
    pub ledger: Ledger,
    pub supervisor: Supervisor,
    pub reconciler: Reconciler,
    pub scheduler: Scheduler,
    pub queue: CronQueue,
    pub activity: Arc<ActivityLog>,
}
