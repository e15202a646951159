use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::domain::report::ReportId;

/// One async mutex per report so transitions on a report run one at a time.
#[derive(Default)]
pub(crate) struct ReportLocks {
    locks: Mutex<HashMap<ReportId, Arc<AsyncMutex<()>>>>,
}

impl ReportLocks {
    pub(crate) async fn acquire(&self, report_id: &ReportId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            // Drop entries nobody holds or waits on.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(report_id.clone()).or_default())
        };
        lock.lock_owned().await
    }
}
