mod abi;
mod rpc;

use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use thiserror::Error;

pub use reqwest::Url;
pub use rpc::JsonRpcChainClient;

/// Every variant is transient from the caller's point of view: the failed read
/// is skipped for the current cycle and retried on the next one.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("rpc transport failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("malformed rpc payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed hex in rpc response: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("invalid quantity {0:?}")]
    Quantity(String),
    #[error("block {0} not found")]
    BlockNotFound(u64),
    #[error("malformed return data for {call}: {reason}")]
    Abi { call: &'static str, reason: String },
    #[error("{0}")]
    Unavailable(String),
}

/// `Validators.getValidatorGroup`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawGroup {
    pub members: Vec<Address>,
    pub commission: U256,
    pub next_commission: U256,
    pub next_commission_block: U256,
    pub slashing_multiplier: U256,
    pub last_slashed: U256,
}

/// `Validators.getValidator`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawValidator {
    pub affiliation: Address,
    pub score: U256,
    pub signer: Address,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawGroupVotes {
    pub total: U256,
    pub active: U256,
    pub pending: U256,
    pub receivable: U256,
}

/// `Governance.getProposal`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawProposal {
    pub proposer: Address,
    pub deposit: U256,
    pub timestamp: U256,
    pub transaction_count: U256,
    pub description_url: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VoteTotals {
    pub yes: U256,
    pub no: U256,
    pub abstain: U256,
}

/// Holdings of one account, in wei. `pending` is CELO unlocked and waiting
/// out the withdrawal period.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawBalance {
    pub celo: U256,
    pub cusd: U256,
    pub locked_celo: U256,
    pub pending: U256,
}

/// Proposals waiting to be dequeued, with their upvotes at matching positions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProposalQueue {
    pub ids: Vec<U256>,
    pub upvotes: Vec<U256>,
}

impl ProposalQueue {
    pub fn upvotes_for(&self, id: u64) -> Option<U256> {
        let id = U256::from(id);
        self.ids
            .iter()
            .position(|queued| *queued == id)
            .and_then(|position| self.upvotes.get(position).copied())
    }
}

/// Read access to the chain. Implementations are shared across the fan-out of
/// a poll cycle, so they must be callable concurrently.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn block_number(&self) -> Result<u64, ChainError>;
    async fn block_extra_data(&self, height: u64) -> Result<Vec<u8>, ChainError>;
    /// Elected signers in the order used to index seal bitmaps.
    async fn current_signers(&self) -> Result<Vec<Address>, ChainError>;

    async fn group_info(&self, group: Address) -> Result<RawGroup, ChainError>;
    async fn validator_info(&self, validator: Address) -> Result<RawValidator, ChainError>;
    async fn account_name(&self, account: Address) -> Result<String, ChainError>;
    async fn vote_signer(&self, account: Address) -> Result<Address, ChainError>;
    async fn metadata_url(&self, account: Address) -> Result<String, ChainError>;
    async fn group_eligibility(&self, group: Address) -> Result<bool, ChainError>;
    async fn group_votes(&self, group: Address) -> Result<RawGroupVotes, ChainError>;

    async fn proposal_count(&self) -> Result<u64, ChainError>;
    async fn proposal(&self, id: u64) -> Result<RawProposal, ChainError>;
    async fn proposal_stage(&self, id: u64) -> Result<u64, ChainError>;
    async fn vote_totals(&self, id: u64) -> Result<VoteTotals, ChainError>;
    async fn queue(&self) -> Result<ProposalQueue, ChainError>;
    async fn dequeue(&self) -> Result<Vec<U256>, ChainError>;
    async fn is_approved(&self, id: u64) -> Result<bool, ChainError>;

    async fn account_balance(&self, account: Address) -> Result<RawBalance, ChainError>;
}
