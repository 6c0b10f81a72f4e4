use crate::chain::{ChainClient, ChainError, RawGroupVotes};
use crate::metadata::MetadataFetcher;
use alloy_primitives::{Address, U256};
use futures::future::{join_all, try_join_all};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("could not read group {group}: {source}")]
    Fetch {
        group: Address,
        #[source]
        source: ChainError,
    },
    #[error("group {group} has a zero slashing multiplier")]
    ZeroMultiplier { group: Address },
    #[error("commission value {value} of group {group} is out of decimal range")]
    CommissionOverflow { group: Address, value: String },
}

/// Locked CELO voting for a group, as decimal strings of wei.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupVotes {
    pub total: String,
    pub active: String,
    pub pending: String,
    pub receivable: String,
}

impl From<RawGroupVotes> for GroupVotes {
    fn from(raw: RawGroupVotes) -> Self {
        Self {
            total: raw.total.to_string(),
            active: raw.active.to_string(),
            pending: raw.pending.to_string(),
            receivable: raw.receivable.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorSnapshot {
    pub address: Address,
    pub vote_signer: Address,
    pub elected: bool,
    pub score: String,
}

/// Everything tracked about a group at one point in time. `members` keeps the
/// on-chain member order, which is stored as each validator's position.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSnapshot {
    pub address: Address,
    pub name: String,
    pub is_eligible: bool,
    pub commission: Decimal,
    pub last_slashed: String,
    pub domain: String,
    pub vote_signer: Address,
    pub votes: GroupVotes,
    pub members: Vec<ValidatorSnapshot>,
}

fn commission_ratio(
    group: Address,
    commission: U256,
    multiplier: U256,
) -> Result<Decimal, SnapshotError> {
    if multiplier.is_zero() {
        return Err(SnapshotError::ZeroMultiplier { group });
    }
    let decimal = |value: U256| {
        Decimal::from_str(&value.to_string()).map_err(|_| SnapshotError::CommissionOverflow {
            group,
            value: value.to_string(),
        })
    };
    decimal(commission)?
        .checked_div(decimal(multiplier)?)
        .map(|ratio| ratio.normalize())
        .ok_or_else(|| SnapshotError::CommissionOverflow {
            group,
            value: commission.to_string(),
        })
}

pub struct GroupSnapshotter {
    chain: Arc<dyn ChainClient>,
    metadata: MetadataFetcher,
}

impl GroupSnapshotter {
    pub fn new(chain: Arc<dyn ChainClient>, metadata: MetadataFetcher) -> Self {
        Self { chain, metadata }
    }

    /// One result per requested group, in request order. A failing group does
    /// not affect the others.
    pub async fn snapshot_groups(&self, groups: &[Address]) -> Vec<Result<GroupSnapshot, SnapshotError>> {
        join_all(groups.iter().map(|group| self.snapshot_group(*group))).await
    }

    pub async fn snapshot_group(&self, group: Address) -> Result<GroupSnapshot, SnapshotError> {
        let fetch = move |source| SnapshotError::Fetch { group, source };
        let chain = self.chain.as_ref();

        let reads = async {
            futures::try_join!(
                chain.group_info(group),
                chain.account_name(group),
                chain.group_eligibility(group),
                chain.group_votes(group),
                chain.vote_signer(group),
                chain.current_signers(),
            )
        };
        let (reads, domain) = futures::join!(reads, self.domain(group));
        let (info, name, is_eligible, votes, vote_signer, signers) = reads.map_err(fetch)?;

        let members = try_join_all(
            info.members
                .iter()
                .map(|member| self.snapshot_member(*member, &signers)),
        )
        .await
        .map_err(fetch)?;

        Ok(GroupSnapshot {
            address: group,
            name,
            is_eligible,
            commission: commission_ratio(group, info.commission, info.slashing_multiplier)?,
            last_slashed: info.last_slashed.to_string(),
            domain,
            vote_signer,
            votes: votes.into(),
            members,
        })
    }

    async fn snapshot_member(
        &self,
        member: Address,
        signers: &[Address],
    ) -> Result<ValidatorSnapshot, ChainError> {
        let (info, vote_signer) = futures::try_join!(
            self.chain.validator_info(member),
            self.chain.vote_signer(member),
        )?;
        Ok(ValidatorSnapshot {
            address: member,
            vote_signer,
            elected: signers.contains(&info.signer),
            score: info.score.to_string(),
        })
    }

    async fn domain(&self, group: Address) -> String {
        match self.chain.metadata_url(group).await {
            Ok(url) => self.metadata.domain_or_default(group, &url).await,
            Err(error) => {
                warn!(address = %group, %error, "could not read metadata url");
                String::new()
            }
        }
    }
}
