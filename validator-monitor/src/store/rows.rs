use super::StorageError;
use rust_decimal::Decimal;
use serde::Serialize;
use snapshot_lib::group::{GroupSnapshot, GroupVotes, ValidatorSnapshot};
use snapshot_lib::proposal::{
    ApprovalEvent, DequeueEvent, ExecutionEvent, ProposalSnapshot, ProposalStage, Proposer,
    VoteTally,
};
use snapshot_lib::Address;
use std::str::FromStr;

pub(super) fn address_column(address: &Address) -> String {
    address.to_string()
}

pub(super) fn parse_address(column: &'static str, value: &str) -> Result<Address, StorageError> {
    Address::from_str(value).map_err(|_| StorageError::InvalidColumn {
        column,
        value: value.to_string(),
    })
}

pub(super) fn commission_column(commission: &Decimal) -> String {
    commission.normalize().to_string()
}

pub(super) fn to_integer(what: &'static str, value: u64) -> Result<i64, StorageError> {
    i64::try_from(value).map_err(|_| StorageError::OutOfRange { what, value })
}

fn from_integer(column: &'static str, value: i64) -> Result<u64, StorageError> {
    u64::try_from(value).map_err(|_| StorageError::InvalidColumn {
        column,
        value: value.to_string(),
    })
}

#[derive(Debug, sqlx::FromRow)]
pub(super) struct GroupRow {
    pub id: i64,
    pub address: String,
    pub name: String,
    pub is_eligible: bool,
    pub commission: String,
    pub last_slashed: String,
    pub domain: String,
    pub vote_signer: String,
}

impl GroupRow {
    pub fn matches(&self, group: &GroupSnapshot) -> bool {
        self.name == group.name
            && self.is_eligible == group.is_eligible
            && self.commission == commission_column(&group.commission)
            && self.last_slashed == group.last_slashed
            && self.domain == group.domain
            && self.vote_signer == address_column(&group.vote_signer)
    }

    pub fn into_snapshot(
        self,
        votes: GroupVotes,
        members: Vec<ValidatorSnapshot>,
    ) -> Result<GroupSnapshot, StorageError> {
        Ok(GroupSnapshot {
            address: parse_address("validator_group.address", &self.address)?,
            commission: Decimal::from_str(&self.commission).map_err(|_| {
                StorageError::InvalidColumn {
                    column: "validator_group.commission",
                    value: self.commission.clone(),
                }
            })?,
            vote_signer: parse_address("validator_group.vote_signer", &self.vote_signer)?,
            name: self.name,
            is_eligible: self.is_eligible,
            last_slashed: self.last_slashed,
            domain: self.domain,
            votes,
            members,
        })
    }
}

#[derive(Debug, PartialEq, Eq, sqlx::FromRow)]
pub(super) struct GroupVotesRow {
    pub total: String,
    pub active: String,
    pub pending: String,
    pub receivable: String,
}

impl GroupVotesRow {
    pub fn matches(&self, votes: &GroupVotes) -> bool {
        self.total == votes.total
            && self.active == votes.active
            && self.pending == votes.pending
            && self.receivable == votes.receivable
    }
}

impl From<GroupVotesRow> for GroupVotes {
    fn from(row: GroupVotesRow) -> Self {
        Self {
            total: row.total,
            active: row.active,
            pending: row.pending,
            receivable: row.receivable,
        }
    }
}

/// A validator row. Everything but the address is unset for validators that
/// have only been seen missing a signature.
#[derive(Debug, sqlx::FromRow)]
pub(super) struct ValidatorRow {
    pub group_id: Option<i64>,
    pub position: Option<i64>,
    pub address: String,
    pub vote_signer: Option<String>,
    pub elected: Option<bool>,
    pub score: Option<String>,
}

impl ValidatorRow {
    pub fn matches(&self, group_id: i64, position: i64, member: &ValidatorSnapshot) -> bool {
        self.group_id == Some(group_id)
            && self.position == Some(position)
            && self.vote_signer.as_deref() == Some(address_column(&member.vote_signer).as_str())
            && self.elected == Some(member.elected)
            && self.score.as_deref() == Some(member.score.as_str())
    }

    pub fn into_snapshot(self) -> Result<ValidatorSnapshot, StorageError> {
        Ok(ValidatorSnapshot {
            address: parse_address("validator.address", &self.address)?,
            vote_signer: self
                .vote_signer
                .map(|signer| parse_address("validator.vote_signer", &signer))
                .transpose()?
                .unwrap_or_default(),
            elected: self.elected.unwrap_or_default(),
            score: self.score.unwrap_or_default(),
        })
    }
}

/// A stored validator together with the group it currently belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorRecord {
    pub address: Address,
    pub group: Option<Address>,
    pub position: Option<u64>,
    pub vote_signer: Option<Address>,
    pub elected: Option<bool>,
    pub score: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
pub(super) struct ValidatorRecordRow {
    pub address: String,
    pub group_address: Option<String>,
    pub position: Option<i64>,
    pub vote_signer: Option<String>,
    pub elected: Option<bool>,
    pub score: Option<String>,
}

impl TryFrom<ValidatorRecordRow> for ValidatorRecord {
    type Error = StorageError;

    fn try_from(row: ValidatorRecordRow) -> Result<Self, Self::Error> {
        Ok(Self {
            address: parse_address("validator.address", &row.address)?,
            group: row
                .group_address
                .map(|group| parse_address("validator_group.address", &group))
                .transpose()?,
            position: row
                .position
                .map(|position| from_integer("validator.position", position))
                .transpose()?,
            vote_signer: row
                .vote_signer
                .map(|signer| parse_address("validator.vote_signer", &signer))
                .transpose()?,
            elected: row.elected,
            score: row.score,
        })
    }
}

/// The proposal's own columns, with sub-entities by id.
#[derive(Debug, PartialEq, Eq, sqlx::FromRow)]
pub(super) struct ProposalRow {
    pub stage: String,
    pub timespan: String,
    pub title: String,
    pub description: String,
    pub upvotes: String,
    pub proposer_id: i64,
    pub vote_tally_id: i64,
    pub dequeue_id: i64,
    pub approval_id: i64,
    pub execution_id: i64,
}

/// A proposal joined with all of its sub-entities.
#[derive(Debug, sqlx::FromRow)]
pub(super) struct ProposalDetailRow {
    pub proposal_id: i64,
    pub stage: String,
    pub timespan: String,
    pub title: String,
    pub description: String,
    pub upvotes: String,
    pub proposer_address: String,
    pub proposer_deposit: String,
    pub proposer_timestamp: String,
    pub tally_total: String,
    pub tally_yes: String,
    pub tally_no: String,
    pub tally_abstain: String,
    pub dequeued: bool,
    pub queue_index: i64,
    pub dequeue_address: String,
    pub dequeue_timestamp: String,
    pub approved: bool,
    pub approval_address: String,
    pub approval_timestamp: String,
    pub execution_sender: String,
    pub execution_timestamp: String,
    pub execution_block_number: String,
    pub execution_tx_hash: String,
}

impl TryFrom<ProposalDetailRow> for ProposalSnapshot {
    type Error = StorageError;

    fn try_from(row: ProposalDetailRow) -> Result<Self, Self::Error> {
        let stage = ProposalStage::from_str(&row.stage).map_err(|_| StorageError::InvalidColumn {
            column: "proposal.stage",
            value: row.stage.clone(),
        })?;
        let index = match row.queue_index {
            -1 => None,
            index => Some(from_integer("dequeue.queue_index", index)?),
        };
        Ok(Self {
            id: from_integer("proposal.proposal_id", row.proposal_id)?,
            stage,
            timespan: row.timespan,
            title: row.title,
            description: row.description,
            upvotes: row.upvotes,
            proposer: Proposer {
                address: parse_address("proposer.address", &row.proposer_address)?,
                deposit: row.proposer_deposit,
                timestamp: row.proposer_timestamp,
            },
            votes: VoteTally {
                total: row.tally_total,
                yes: row.tally_yes,
                no: row.tally_no,
                abstain: row.tally_abstain,
            },
            dequeue: DequeueEvent {
                dequeued: row.dequeued,
                index,
                address: row.dequeue_address,
                timestamp: row.dequeue_timestamp,
            },
            approval: ApprovalEvent {
                approved: row.approved,
                address: row.approval_address,
                timestamp: row.approval_timestamp,
            },
            execution: ExecutionEvent {
                from: row.execution_sender,
                timestamp: row.execution_timestamp,
                block_number: row.execution_block_number,
                tx_hash: row.execution_tx_hash,
            },
        })
    }
}
