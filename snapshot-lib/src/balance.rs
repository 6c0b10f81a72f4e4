use crate::chain::{ChainClient, ChainError, RawBalance};
use alloy_primitives::Address;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("could not read the balance of {account}: {source}")]
pub struct BalanceError {
    pub account: Address,
    #[source]
    pub source: ChainError,
}

/// Holdings summed over every watched wallet, as decimal strings of wei.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceTotals {
    #[serde(rename = "CELO")]
    pub celo: String,
    #[serde(rename = "cUSD")]
    pub cusd: String,
    #[serde(rename = "lockedCELO")]
    pub locked_celo: String,
    pub pending: String,
}

impl From<RawBalance> for BalanceTotals {
    fn from(raw: RawBalance) -> Self {
        Self {
            celo: raw.celo.to_string(),
            cusd: raw.cusd.to_string(),
            locked_celo: raw.locked_celo.to_string(),
            pending: raw.pending.to_string(),
        }
    }
}

fn accumulate(total: RawBalance, balance: RawBalance) -> RawBalance {
    RawBalance {
        celo: total.celo.saturating_add(balance.celo),
        cusd: total.cusd.saturating_add(balance.cusd),
        locked_celo: total.locked_celo.saturating_add(balance.locked_celo),
        pending: total.pending.saturating_add(balance.pending),
    }
}

pub struct BalanceChecker {
    chain: Arc<dyn ChainClient>,
    wallets: Vec<Address>,
}

impl BalanceChecker {
    pub fn new(chain: Arc<dyn ChainClient>, wallets: Vec<Address>) -> Self {
        Self { chain, wallets }
    }

    pub fn wallets(&self) -> &[Address] {
        &self.wallets
    }

    /// Reads every wallet concurrently. One failed read fails the total, so a
    /// partial sum is never reported.
    pub async fn total(&self) -> Result<BalanceTotals, BalanceError> {
        let balances = try_join_all(self.wallets.iter().map(|account| async move {
            self.chain
                .account_balance(*account)
                .await
                .map_err(|source| BalanceError {
                    account: *account,
                    source,
                })
        }))
        .await?;
        Ok(balances
            .into_iter()
            .fold(RawBalance::default(), accumulate)
            .into())
    }
}
