use crate::store::ReconciliationStore;
use serde::Serialize;
use snapshot_lib::bitmap::{decode_unsigned, DecodeError, SignatureBitmap};
use snapshot_lib::istanbul::{parent_aggregated_seal, ExtraDataError};
use snapshot_lib::{Address, BlockHeight, ChainClient, ChainError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum LivenessError {
    #[error("could not read block {height}: {source}")]
    Fetch {
        height: BlockHeight,
        #[source]
        source: ChainError,
    },
    #[error("malformed extra data in block {height}: {source}")]
    ExtraData {
        height: BlockHeight,
        #[source]
        source: ExtraDataError,
    },
    #[error("could not decode the seal bitmap of block {height}: {source}")]
    Decode {
        height: BlockHeight,
        #[source]
        source: DecodeError,
    },
}

/// Participation in the parent seal carried by one block.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LivenessReport {
    pub height: BlockHeight,
    /// Monitored, elected signers that did not sign.
    pub missed_monitored: Vec<Address>,
    /// Every elected signer that did not sign, in signer-set order.
    pub missed_all: Vec<Address>,
    /// Monitored signers that are not in the elected set.
    pub unelected_monitored: Vec<Address>,
    /// Missed signers whose miss could not be stored.
    pub unrecorded: Vec<Address>,
}

pub struct LivenessTracker {
    chain: Arc<dyn ChainClient>,
    store: ReconciliationStore,
    monitored: Vec<Address>,
}

impl LivenessTracker {
    pub fn new(chain: Arc<dyn ChainClient>, store: ReconciliationStore, monitored: Vec<Address>) -> Self {
        Self {
            chain,
            store,
            monitored,
        }
    }

    /// Classifies the signers of block `height` and records every elected
    /// signer that missed it. Nothing is recorded unless the block decodes.
    pub async fn observe(&self, height: BlockHeight) -> Result<LivenessReport, LivenessError> {
        let (extra_data, signers) = futures::try_join!(
            self.chain.block_extra_data(height),
            self.chain.current_signers(),
        )
        .map_err(|source| LivenessError::Fetch { height, source })?;

        let seal = parent_aggregated_seal(&extra_data)
            .map_err(|source| LivenessError::ExtraData { height, source })?;
        let missed_all = SignatureBitmap::from_seal_integer(&seal.bitmap, signers.len())
            .and_then(|bitmap| decode_unsigned(&signers, &bitmap))
            .map_err(|source| LivenessError::Decode { height, source })?;

        let (elected, unelected_monitored): (Vec<Address>, Vec<Address>) = self
            .monitored
            .iter()
            .partition(|address| signers.contains(*address));
        for address in &unelected_monitored {
            info!(%address, height, "monitored signer is not elected, skipping");
        }
        let missed_monitored = elected
            .into_iter()
            .filter(|address| missed_all.contains(address))
            .collect::<Vec<_>>();

        let mut unrecorded = Vec::new();
        for address in &missed_all {
            if let Err(error) = self.store.save_unsigned_validator(height, *address).await {
                warn!(%address, height, %error, "could not record unsigned validator");
                unrecorded.push(*address);
            }
        }
        if !missed_monitored.is_empty() {
            warn!(height, missed = ?missed_monitored, "monitored signers missed a block");
        }

        Ok(LivenessReport {
            height,
            missed_monitored,
            missed_all,
            unelected_monitored,
            unrecorded,
        })
    }
}
