use crate::liveness::{LivenessError, LivenessReport, LivenessTracker};
use crate::status::StatusBoard;
use crate::store::{ReconciliationStore, StorageError};
use serde::Serialize;
use snapshot_lib::balance::{BalanceChecker, BalanceError, BalanceTotals};
use snapshot_lib::group::{self, GroupSnapshotter};
use snapshot_lib::proposal::{self, ProposalSnapshotter};
use snapshot_lib::{Address, BlockHeight, ChainClient, ChainError, ProposalId};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStage {
    BlockNumber,
    Liveness,
    Groups,
    Proposals,
    Balances,
}

impl CycleStage {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::BlockNumber => "block_number",
            Self::Liveness => "liveness",
            Self::Groups => "groups",
            Self::Proposals => "proposals",
            Self::Balances => "balances",
        }
    }
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("could not read the block number: {0}")]
    BlockNumber(#[source] ChainError),
    #[error(transparent)]
    Liveness(#[from] LivenessError),
    #[error("could not record {count} unsigned validators at block {height}")]
    UnsignedStore { height: BlockHeight, count: usize },
    #[error(transparent)]
    GroupSnapshot(#[from] group::SnapshotError),
    #[error("could not store group {group}: {source}")]
    GroupStore {
        group: Address,
        #[source]
        source: StorageError,
    },
    #[error("could not read the proposal count: {0}")]
    ProposalCount(#[source] ChainError),
    #[error(transparent)]
    ProposalSnapshot(#[from] proposal::SnapshotError),
    #[error("could not store proposal {id}: {source}")]
    ProposalStore {
        id: ProposalId,
        #[source]
        source: StorageError,
    },
    #[error(transparent)]
    Balances(#[from] BalanceError),
}

impl CycleError {
    pub fn stage(&self) -> CycleStage {
        match self {
            Self::BlockNumber(_) => CycleStage::BlockNumber,
            Self::Liveness(_) | Self::UnsignedStore { .. } => CycleStage::Liveness,
            Self::GroupSnapshot(_) | Self::GroupStore { .. } => CycleStage::Groups,
            Self::ProposalCount(_) | Self::ProposalSnapshot(_) | Self::ProposalStore { .. } => {
                CycleStage::Proposals
            }
            Self::Balances(_) => CycleStage::Balances,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CycleFailure {
    pub stage: CycleStage,
    pub error: String,
}

/// Outcome of one poll cycle. Failures are per entity or per stage; a cycle
/// with failures still reports everything that succeeded.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub height: Option<BlockHeight>,
    pub liveness: Option<LivenessReport>,
    pub groups_reconciled: usize,
    pub groups_written: usize,
    pub proposals_reconciled: usize,
    pub proposals_written: usize,
    /// Absent when no wallets are watched or the read failed.
    pub balances: Option<BalanceTotals>,
    pub failures: Vec<CycleFailure>,
}

impl CycleReport {
    fn record(&mut self, error: CycleError) {
        warn!(stage = error.stage().as_str(), error = %error, "poll cycle stage failed");
        self.failures.push(CycleFailure {
            stage: error.stage(),
            error: error.to_string(),
        });
    }
}

pub struct PollLoop {
    chain: Arc<dyn ChainClient>,
    store: ReconciliationStore,
    liveness: LivenessTracker,
    groups: GroupSnapshotter,
    proposals: ProposalSnapshotter,
    balances: BalanceChecker,
    group_addresses: Vec<Address>,
    delay: Duration,
    status: Arc<StatusBoard>,
}

impl PollLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: Arc<dyn ChainClient>,
        store: ReconciliationStore,
        liveness: LivenessTracker,
        groups: GroupSnapshotter,
        proposals: ProposalSnapshotter,
        balances: BalanceChecker,
        group_addresses: Vec<Address>,
        delay: Duration,
        status: Arc<StatusBoard>,
    ) -> Self {
        Self {
            chain,
            store,
            liveness,
            groups,
            proposals,
            balances,
            group_addresses,
            delay,
            status,
        }
    }

    /// Runs cycles until `shutdown` turns true. Each cycle starts `delay` after
    /// the previous one finished; a running cycle is never interrupted.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(delay_secs = self.delay.as_secs(), "poll loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let started = Instant::now();
            let report = self.run_cycle().await;
            debug!(
                height = report.height,
                failures = report.failures.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "poll cycle finished"
            );

            tokio::select! {
                _ = time::sleep(self.delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("poll loop stopped");
    }

    /// Block height, then liveness, groups, proposals and balances. A failed
    /// stage is recorded and the remaining stages still run.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();

        match self.chain.block_number().await {
            Ok(height) => {
                report.height = Some(height);
                match self.liveness.observe(height).await {
                    Ok(liveness) => {
                        if !liveness.unrecorded.is_empty() {
                            report.record(CycleError::UnsignedStore {
                                height,
                                count: liveness.unrecorded.len(),
                            });
                        }
                        self.status.publish_liveness(liveness.clone());
                        report.liveness = Some(liveness);
                    }
                    Err(error) => report.record(error.into()),
                }
            }
            Err(error) => report.record(CycleError::BlockNumber(error)),
        }

        self.reconcile_groups(&mut report).await;
        if let Err(error) = self.reconcile_proposals(&mut report).await {
            report.record(error);
        }
        if !self.balances.wallets().is_empty() {
            match self.balances.total().await {
                Ok(totals) => {
                    info!(
                        celo = %totals.celo,
                        cusd = %totals.cusd,
                        locked_celo = %totals.locked_celo,
                        pending = %totals.pending,
                        "total balance"
                    );
                    self.status.publish_balances(totals.clone());
                    report.balances = Some(totals);
                }
                Err(error) => report.record(error.into()),
            }
        }

        self.status.publish_cycle(report.clone());
        report
    }

    async fn reconcile_groups(&self, report: &mut CycleReport) {
        for snapshot in self.groups.snapshot_groups(&self.group_addresses).await {
            let snapshot = match snapshot {
                Ok(snapshot) => snapshot,
                Err(error) => {
                    report.record(error.into());
                    continue;
                }
            };
            match self.store.upsert_group(&snapshot).await {
                Ok(writes) => {
                    report.groups_reconciled += 1;
                    if !writes.is_noop() {
                        report.groups_written += 1;
                    }
                }
                Err(source) => report.record(CycleError::GroupStore {
                    group: snapshot.address,
                    source,
                }),
            }
        }
    }

    async fn reconcile_proposals(&self, report: &mut CycleReport) -> Result<(), CycleError> {
        let count = self
            .chain
            .proposal_count()
            .await
            .map_err(CycleError::ProposalCount)?;
        for snapshot in self.proposals.snapshot_proposals(count).await? {
            let snapshot = match snapshot {
                Ok(snapshot) => snapshot,
                Err(error) => {
                    report.record(error.into());
                    continue;
                }
            };
            match self.store.upsert_proposal(&snapshot).await {
                Ok(writes) => {
                    report.proposals_reconciled += 1;
                    if !writes.is_noop() {
                        report.proposals_written += 1;
                    }
                }
                Err(source) => report.record(CycleError::ProposalStore {
                    id: snapshot.id,
                    source,
                }),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapshot_lib::chain::{RawBalance, RawGroup, RawProposal, RawValidator};
    use snapshot_lib::mock::{istanbul_extra_from_bits, MockChainClient, MockGroup, MockProposal};
    use snapshot_lib::{MetadataFetcher, U256};

    const HEIGHT: BlockHeight = 77;

    fn address(byte: u8) -> Address {
        Address::with_last_byte(byte)
    }

    fn chain() -> Arc<MockChainClient> {
        let chain = Arc::new(MockChainClient::default());
        chain.set_block_number(HEIGHT);
        chain.set_signers(vec![address(0x41), address(0x42)]);
        chain.set_block(HEIGHT, istanbul_extra_from_bits(&[true, false]));
        chain.set_group(
            address(1),
            MockGroup {
                info: RawGroup {
                    members: vec![address(0x11)],
                    commission: U256::from(1u64),
                    slashing_multiplier: U256::from(10u64),
                    ..Default::default()
                },
                eligible: true,
                ..Default::default()
            },
        );
        chain.set_validator(
            address(0x11),
            RawValidator {
                affiliation: address(1),
                score: U256::from(5u64),
                signer: address(0x41),
            },
        );
        chain.set_proposal(
            0,
            MockProposal {
                record: RawProposal {
                    proposer: address(0xaa),
                    ..Default::default()
                },
                stage: 1,
                ..Default::default()
            },
        );
        chain
    }

    async fn poll_loop(chain: Arc<MockChainClient>, groups: Vec<Address>) -> (PollLoop, ReconciliationStore, Arc<StatusBoard>) {
        poll_loop_with_wallets(chain, groups, vec![]).await
    }

    async fn poll_loop_with_wallets(
        chain: Arc<MockChainClient>,
        groups: Vec<Address>,
        wallets: Vec<Address>,
    ) -> (PollLoop, ReconciliationStore, Arc<StatusBoard>) {
        let store = ReconciliationStore::in_memory().await.unwrap();
        let status = Arc::new(StatusBoard::new());
        let poll = PollLoop::new(
            chain.clone(),
            store.clone(),
            LivenessTracker::new(chain.clone(), store.clone(), vec![address(0x42)]),
            GroupSnapshotter::new(
                chain.clone(),
                MetadataFetcher::new(Duration::from_secs(1)).unwrap(),
            ),
            ProposalSnapshotter::new(chain.clone(), 2),
            BalanceChecker::new(chain, wallets),
            groups,
            Duration::from_millis(10),
            status.clone(),
        );
        (poll, store, status)
    }

    #[tokio::test]
    async fn a_clean_cycle_reconciles_everything() {
        let (poll, store, status) = poll_loop(chain(), vec![address(1)]).await;

        let report = poll.run_cycle().await;

        assert_eq!(report.height, Some(HEIGHT));
        assert!(report.failures.is_empty(), "{:?}", report.failures);
        assert_eq!(
            report.liveness.as_ref().unwrap().missed_monitored,
            vec![address(0x42)]
        );
        assert_eq!((report.groups_reconciled, report.groups_written), (1, 1));
        assert_eq!((report.proposals_reconciled, report.proposals_written), (1, 1));
        assert_eq!(status.cycle().as_deref(), Some(&report));
        assert_eq!(store.get_unsigned_validators(HEIGHT).await.unwrap(), vec![address(0x42)]);
        assert_eq!(store.get_group_info(&[address(1)]).await.unwrap().len(), 1);

        let again = poll.run_cycle().await;
        assert_eq!((again.groups_reconciled, again.groups_written), (1, 0));
        assert_eq!(again.proposals_written, 0);
    }

    #[tokio::test]
    async fn stage_failures_do_not_stop_the_cycle() {
        let chain = chain();
        chain.fail("block_number");
        let (poll, store, status) = poll_loop(chain.clone(), vec![address(1), address(2)]).await;

        let report = poll.run_cycle().await;

        assert_eq!(report.height, None);
        assert!(status.liveness().is_none());
        let stages = report.failures.iter().map(|failure| failure.stage).collect::<Vec<_>>();
        assert_eq!(stages, vec![CycleStage::BlockNumber, CycleStage::Groups]);
        assert_eq!(report.groups_reconciled, 1);
        assert_eq!(report.proposals_reconciled, 1);
        assert_eq!(store.get_proposal_info(&[0]).await.unwrap().len(), 1);

        chain.recover("block_number");
        chain.fail("proposal_count");
        let report = poll.run_cycle().await;
        assert_eq!(report.height, Some(HEIGHT));
        assert!(report
            .failures
            .iter()
            .any(|failure| failure.stage == CycleStage::Proposals));
        assert_eq!(status.liveness().unwrap().height, HEIGHT);
    }

    #[tokio::test]
    async fn balances_run_only_for_watched_wallets() {
        let chain = chain();
        let (poll, _, status) = poll_loop(chain.clone(), vec![]).await;
        let report = poll.run_cycle().await;
        assert_eq!(report.balances, None);
        assert_eq!(chain.calls("account_balance"), 0);
        assert!(status.balances().is_none());

        let wallet = address(0x70);
        chain.set_balance(
            wallet,
            RawBalance {
                celo: U256::from(5u64),
                ..Default::default()
            },
        );
        let (poll, _, status) = poll_loop_with_wallets(chain.clone(), vec![], vec![wallet]).await;
        let report = poll.run_cycle().await;
        assert_eq!(report.balances.as_ref().unwrap().celo, "5");
        assert_eq!(status.balances().unwrap().celo, "5");

        chain.fail("account_balance");
        let report = poll.run_cycle().await;
        assert_eq!(report.balances, None);
        let stages = report.failures.iter().map(|failure| failure.stage).collect::<Vec<_>>();
        assert_eq!(stages, vec![CycleStage::Balances]);
        // the last good totals stay published
        assert_eq!(status.balances().unwrap().celo, "5");
    }

    #[tokio::test]
    async fn unrecorded_misses_fail_the_liveness_stage() {
        let (poll, store, status) = poll_loop(chain(), vec![]).await;
        sqlx::query(
            "CREATE TRIGGER reject_unsigned BEFORE INSERT ON unsigned
             BEGIN SELECT RAISE(ABORT, 'rejected'); END",
        )
        .execute(store.pool())
        .await
        .unwrap();

        let report = poll.run_cycle().await;

        let stages = report.failures.iter().map(|failure| failure.stage).collect::<Vec<_>>();
        assert_eq!(stages, vec![CycleStage::Liveness]);
        let liveness = status.liveness().unwrap();
        assert_eq!(liveness.missed_monitored, vec![address(0x42)]);
        assert_eq!(liveness.unrecorded, vec![address(0x42)]);
        assert!(store.get_unsigned_validators(HEIGHT).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn shutdown_is_observed_between_cycles() {
        let chain = chain();
        let (poll, _, status) = poll_loop(chain.clone(), vec![]).await;
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(poll.run(rx));
        while status.cycle().is_none() {
            time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();
        time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(chain.calls("block_number") >= 1);
    }
}
