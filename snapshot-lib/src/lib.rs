pub mod balance;
pub mod bitmap;
pub mod chain;
pub mod group;
pub mod istanbul;
pub mod metadata;
pub mod proposal;

#[cfg(any(test, feature = "test-api"))]
pub mod mock;

pub use alloy_primitives::{Address, U256};
pub use balance::{BalanceChecker, BalanceTotals};
pub use bitmap::{decode_unsigned, DecodeError, SignatureBitmap};
pub use chain::{ChainClient, ChainError, JsonRpcChainClient};
pub use group::{GroupSnapshot, GroupSnapshotter, GroupVotes, ValidatorSnapshot};
pub use metadata::MetadataFetcher;
pub use proposal::{ProposalSnapshot, ProposalSnapshotter, ProposalStage};

pub type BlockHeight = u64;
pub type ProposalId = u64;
