use crate::liveness::LivenessReport;
use crate::poll::CycleReport;
use arc_swap::ArcSwapOption;
use snapshot_lib::BalanceTotals;
use std::sync::Arc;

/// Latest results of the poll loop. The loop is the only writer; readers get a
/// consistent snapshot without waiting on it.
pub struct StatusBoard {
    liveness: ArcSwapOption<LivenessReport>,
    balances: ArcSwapOption<BalanceTotals>,
    cycle: ArcSwapOption<CycleReport>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self {
            liveness: ArcSwapOption::empty(),
            balances: ArcSwapOption::empty(),
            cycle: ArcSwapOption::empty(),
        }
    }

    pub fn publish_liveness(&self, report: LivenessReport) {
        self.liveness.store(Some(Arc::new(report)));
    }

    pub fn publish_balances(&self, totals: BalanceTotals) {
        self.balances.store(Some(Arc::new(totals)));
    }

    pub fn publish_cycle(&self, report: CycleReport) {
        self.cycle.store(Some(Arc::new(report)));
    }

    /// The last successfully observed block, which may be older than the last
    /// cycle if later observations failed.
    pub fn liveness(&self) -> Option<Arc<LivenessReport>> {
        self.liveness.load_full()
    }

    pub fn balances(&self) -> Option<Arc<BalanceTotals>> {
        self.balances.load_full()
    }

    pub fn cycle(&self) -> Option<Arc<CycleReport>> {
        self.cycle.load_full()
    }
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}
