use crate::chain::{ChainClient, ChainError, ProposalQueue, VoteTotals};
use alloy_primitives::{Address, U256};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Value recorded for event fields the chain does not expose through view calls.
pub const UNKNOWN: &str = "0";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("could not read the proposal queue: {0}")]
    Queue(#[source] ChainError),
    #[error("could not read proposal {id}: {source}")]
    Fetch {
        id: u64,
        #[source]
        source: ChainError,
    },
    #[error("proposal {id} reports unknown stage {stage}")]
    UnknownStage { id: u64, stage: u64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProposalStage {
    None,
    Queued,
    Approval,
    Referendum,
    Execution,
    Expiration,
}

impl ProposalStage {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Queued => "Queued",
            Self::Approval => "Approval",
            Self::Referendum => "Referendum",
            Self::Execution => "Execution",
            Self::Expiration => "Expiration",
        }
    }
}

impl TryFrom<u64> for ProposalStage {
    type Error = u64;

    fn try_from(stage: u64) -> Result<Self, Self::Error> {
        Ok(match stage {
            0 => Self::None,
            1 => Self::Queued,
            2 => Self::Approval,
            3 => Self::Referendum,
            4 => Self::Execution,
            5 => Self::Expiration,
            other => return Err(other),
        })
    }
}

impl fmt::Display for ProposalStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown proposal stage {0:?}")]
pub struct ParseStageError(String);

impl FromStr for ProposalStage {
    type Err = ParseStageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        (0..=5)
            .filter_map(|stage| Self::try_from(stage).ok())
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| ParseStageError(s.to_string()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposer {
    pub address: Address,
    pub deposit: String,
    pub timestamp: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteTally {
    pub total: String,
    pub yes: String,
    pub no: String,
    pub abstain: String,
}

impl From<VoteTotals> for VoteTally {
    fn from(votes: VoteTotals) -> Self {
        Self {
            total: votes
                .yes
                .saturating_add(votes.no)
                .saturating_add(votes.abstain)
                .to_string(),
            yes: votes.yes.to_string(),
            no: votes.no.to_string(),
            abstain: votes.abstain.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DequeueEvent {
    pub dequeued: bool,
    /// Position in the dequeued list, only known once dequeued.
    pub index: Option<u64>,
    pub address: String,
    pub timestamp: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalEvent {
    pub approved: bool,
    pub address: String,
    pub timestamp: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEvent {
    pub from: String,
    pub timestamp: String,
    pub block_number: String,
    pub tx_hash: String,
}

impl ExecutionEvent {
    pub fn unknown() -> Self {
        Self {
            from: UNKNOWN.to_string(),
            timestamp: UNKNOWN.to_string(),
            block_number: UNKNOWN.to_string(),
            tx_hash: UNKNOWN.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalSnapshot {
    pub id: u64,
    pub stage: ProposalStage,
    pub timespan: String,
    pub title: String,
    pub description: String,
    pub upvotes: String,
    pub proposer: Proposer,
    pub votes: VoteTally,
    pub dequeue: DequeueEvent,
    pub approval: ApprovalEvent,
    pub execution: ExecutionEvent,
}

pub struct ProposalSnapshotter {
    chain: Arc<dyn ChainClient>,
    concurrency: usize,
}

impl ProposalSnapshotter {
    pub fn new(chain: Arc<dyn ChainClient>, concurrency: usize) -> Self {
        Self {
            chain,
            concurrency: concurrency.max(1),
        }
    }

    /// Snapshots proposals `0..count`, at most `concurrency` at a time. The
    /// queue and dequeue lists are read once and shared by every proposal, so
    /// failing to read them fails the whole batch.
    pub async fn snapshot_proposals(
        &self,
        count: u64,
    ) -> Result<Vec<Result<ProposalSnapshot, SnapshotError>>, SnapshotError> {
        let (queue, dequeue) = futures::try_join!(self.chain.queue(), self.chain.dequeue())
            .map_err(SnapshotError::Queue)?;

        Ok(stream::iter(0..count)
            .map(|id| self.snapshot_proposal(id, &queue, &dequeue))
            .buffered(self.concurrency)
            .collect()
            .await)
    }

    async fn snapshot_proposal(
        &self,
        id: u64,
        queue: &ProposalQueue,
        dequeue: &[U256],
    ) -> Result<ProposalSnapshot, SnapshotError> {
        let chain = self.chain.as_ref();
        let (record, stage, votes, approved) = futures::try_join!(
            chain.proposal(id),
            chain.proposal_stage(id),
            chain.vote_totals(id),
            chain.is_approved(id),
        )
        .map_err(|source| SnapshotError::Fetch { id, source })?;
        let stage =
            ProposalStage::try_from(stage).map_err(|stage| SnapshotError::UnknownStage { id, stage })?;

        let upvotes = match queue.upvotes_for(id) {
            Some(upvotes) => upvotes.to_string(),
            None => {
                debug!(proposal_id = id, "proposal is not queued");
                "0".to_string()
            }
        };
        let index = dequeue
            .iter()
            .position(|dequeued| *dequeued == U256::from(id))
            .map(|index| index as u64);

        Ok(ProposalSnapshot {
            id,
            stage,
            timespan: UNKNOWN.to_string(),
            title: UNKNOWN.to_string(),
            description: record.description_url,
            upvotes,
            proposer: Proposer {
                address: record.proposer,
                deposit: record.deposit.to_string(),
                timestamp: record.timestamp.to_string(),
            },
            votes: votes.into(),
            dequeue: DequeueEvent {
                dequeued: index.is_some(),
                index,
                address: UNKNOWN.to_string(),
                timestamp: UNKNOWN.to_string(),
            },
            approval: ApprovalEvent {
                approved,
                address: UNKNOWN.to_string(),
                timestamp: UNKNOWN.to_string(),
            },
            execution: ExecutionEvent::unknown(),
        })
    }
}
