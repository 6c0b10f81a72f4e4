//! In-memory chain for tests, here and in dependent crates (`test-api`).

use crate::chain::{
    ChainClient, ChainError, ProposalQueue, RawBalance, RawGroup, RawGroupVotes, RawProposal,
    RawValidator, VoteTotals,
};
use alloy_primitives::{Address, U256};
use alloy_rlp::{Encodable, Header};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

#[derive(Clone, Debug, Default)]
pub struct MockGroup {
    pub info: RawGroup,
    pub eligible: bool,
    pub votes: RawGroupVotes,
}

/// Unknown accounts read as this default, the way the Accounts contract
/// answers for unregistered addresses.
#[derive(Clone, Debug, Default)]
pub struct MockAccount {
    pub name: String,
    pub vote_signer: Address,
    pub metadata_url: String,
}

#[derive(Clone, Debug, Default)]
pub struct MockProposal {
    pub record: RawProposal,
    pub stage: u64,
    pub votes: VoteTotals,
    pub approved: bool,
}

#[derive(Default)]
struct State {
    block_number: u64,
    blocks: HashMap<u64, Vec<u8>>,
    signers: Vec<Address>,
    groups: HashMap<Address, MockGroup>,
    validators: HashMap<Address, RawValidator>,
    accounts: HashMap<Address, MockAccount>,
    proposals: HashMap<u64, MockProposal>,
    queue: ProposalQueue,
    dequeue: Vec<U256>,
    balances: HashMap<Address, RawBalance>,
    failing: HashSet<&'static str>,
    calls: HashMap<&'static str, usize>,
}

#[derive(Default)]
pub struct MockChainClient {
    state: Mutex<State>,
}

impl MockChainClient {
    pub fn set_block_number(&self, height: u64) {
        self.state.lock().block_number = height;
    }

    pub fn set_block(&self, height: u64, extra_data: Vec<u8>) {
        self.state.lock().blocks.insert(height, extra_data);
    }

    pub fn set_signers(&self, signers: Vec<Address>) {
        self.state.lock().signers = signers;
    }

    pub fn set_group(&self, address: Address, group: MockGroup) {
        self.state.lock().groups.insert(address, group);
    }

    pub fn set_validator(&self, address: Address, validator: RawValidator) {
        self.state.lock().validators.insert(address, validator);
    }

    pub fn set_account(&self, address: Address, account: MockAccount) {
        self.state.lock().accounts.insert(address, account);
    }

    pub fn set_proposal(&self, id: u64, proposal: MockProposal) {
        self.state.lock().proposals.insert(id, proposal);
    }

    pub fn set_queue(&self, queue: ProposalQueue) {
        self.state.lock().queue = queue;
    }

    pub fn set_dequeue(&self, dequeue: Vec<U256>) {
        self.state.lock().dequeue = dequeue;
    }

    pub fn set_balance(&self, account: Address, balance: RawBalance) {
        self.state.lock().balances.insert(account, balance);
    }

    /// Makes every call to `method` fail until [`Self::recover`] is called.
    pub fn fail(&self, method: &'static str) {
        self.state.lock().failing.insert(method);
    }

    pub fn recover(&self, method: &'static str) {
        self.state.lock().failing.remove(method);
    }

    pub fn calls(&self, method: &str) -> usize {
        self.state.lock().calls.get(method).copied().unwrap_or(0)
    }

    fn read<T>(
        &self,
        method: &'static str,
        f: impl FnOnce(&State) -> Result<T, ChainError>,
    ) -> Result<T, ChainError> {
        let mut state = self.state.lock();
        *state.calls.entry(method).or_default() += 1;
        if state.failing.contains(method) {
            return Err(ChainError::Unavailable(format!("{method} is failing")));
        }
        f(&state)
    }
}

fn missing(what: &str, key: impl std::fmt::Display) -> ChainError {
    ChainError::Unavailable(format!("no {what} for {key}"))
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn block_number(&self) -> Result<u64, ChainError> {
        self.read("block_number", |state| Ok(state.block_number))
    }

    async fn block_extra_data(&self, height: u64) -> Result<Vec<u8>, ChainError> {
        self.read("block_extra_data", |state| {
            state
                .blocks
                .get(&height)
                .cloned()
                .ok_or(ChainError::BlockNotFound(height))
        })
    }

    async fn current_signers(&self) -> Result<Vec<Address>, ChainError> {
        self.read("current_signers", |state| Ok(state.signers.clone()))
    }

    async fn group_info(&self, group: Address) -> Result<RawGroup, ChainError> {
        self.read("group_info", |state| {
            state
                .groups
                .get(&group)
                .map(|group| group.info.clone())
                .ok_or_else(|| missing("group", group))
        })
    }

    async fn validator_info(&self, validator: Address) -> Result<RawValidator, ChainError> {
        self.read("validator_info", |state| {
            state
                .validators
                .get(&validator)
                .cloned()
                .ok_or_else(|| missing("validator", validator))
        })
    }

    async fn account_name(&self, account: Address) -> Result<String, ChainError> {
        self.read("account_name", |state| {
            Ok(state
                .accounts
                .get(&account)
                .map(|account| account.name.clone())
                .unwrap_or_default())
        })
    }

    async fn vote_signer(&self, account: Address) -> Result<Address, ChainError> {
        self.read("vote_signer", |state| {
            Ok(state
                .accounts
                .get(&account)
                .map(|account| account.vote_signer)
                .unwrap_or_default())
        })
    }

    async fn metadata_url(&self, account: Address) -> Result<String, ChainError> {
        self.read("metadata_url", |state| {
            Ok(state
                .accounts
                .get(&account)
                .map(|account| account.metadata_url.clone())
                .unwrap_or_default())
        })
    }

    async fn group_eligibility(&self, group: Address) -> Result<bool, ChainError> {
        self.read("group_eligibility", |state| {
            Ok(state.groups.get(&group).map_or(false, |group| group.eligible))
        })
    }

    async fn group_votes(&self, group: Address) -> Result<RawGroupVotes, ChainError> {
        self.read("group_votes", |state| {
            Ok(state
                .groups
                .get(&group)
                .map(|group| group.votes.clone())
                .unwrap_or_default())
        })
    }

    async fn proposal_count(&self) -> Result<u64, ChainError> {
        self.read("proposal_count", |state| {
            Ok(state.proposals.keys().max().map_or(0, |id| id + 1))
        })
    }

    async fn proposal(&self, id: u64) -> Result<RawProposal, ChainError> {
        self.read("proposal", |state| {
            state
                .proposals
                .get(&id)
                .map(|proposal| proposal.record.clone())
                .ok_or_else(|| missing("proposal", id))
        })
    }

    async fn proposal_stage(&self, id: u64) -> Result<u64, ChainError> {
        self.read("proposal_stage", |state| {
            state
                .proposals
                .get(&id)
                .map(|proposal| proposal.stage)
                .ok_or_else(|| missing("proposal", id))
        })
    }

    async fn vote_totals(&self, id: u64) -> Result<VoteTotals, ChainError> {
        self.read("vote_totals", |state| {
            state
                .proposals
                .get(&id)
                .map(|proposal| proposal.votes.clone())
                .ok_or_else(|| missing("proposal", id))
        })
    }

    async fn queue(&self) -> Result<ProposalQueue, ChainError> {
        self.read("queue", |state| Ok(state.queue.clone()))
    }

    async fn dequeue(&self) -> Result<Vec<U256>, ChainError> {
        self.read("dequeue", |state| Ok(state.dequeue.clone()))
    }

    async fn is_approved(&self, id: u64) -> Result<bool, ChainError> {
        self.read("is_approved", |state| {
            state
                .proposals
                .get(&id)
                .map(|proposal| proposal.approved)
                .ok_or_else(|| missing("proposal", id))
        })
    }

    async fn account_balance(&self, account: Address) -> Result<RawBalance, ChainError> {
        self.read("account_balance", |state| {
            Ok(state.balances.get(&account).cloned().unwrap_or_default())
        })
    }
}

pub fn rlp_string(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    bytes.encode(&mut out);
    out
}

pub fn rlp_list(items: &[Vec<u8>]) -> Vec<u8> {
    let payload = items.concat();
    let mut out = Vec::new();
    Header {
        list: true,
        payload_length: payload.len(),
    }
    .encode(&mut out);
    out.extend(payload);
    out
}

/// Block extra data whose parent aggregated seal carries `bitmap_be`, the
/// participation bitmap as a big-endian integer.
pub fn istanbul_extra(bitmap_be: &[u8]) -> Vec<u8> {
    let mut extra = vec![0u8; 32];
    extra.extend(rlp_list(&[
        rlp_list(&[]),
        rlp_list(&[]),
        rlp_string(&[]),
        rlp_string(&[0xaa; 65]),
        rlp_list(&[rlp_string(&[]), rlp_string(&[0xbb; 48]), rlp_string(&[])]),
        rlp_list(&[
            rlp_string(bitmap_be),
            rlp_string(&[0xcc; 48]),
            rlp_string(&[0x01]),
        ]),
    ]));
    extra
}

/// [`istanbul_extra`] for a bitmap given as one flag per signer index.
pub fn istanbul_extra_from_bits(bits: &[bool]) -> Vec<u8> {
    let mut le = vec![0u8; bits.len().div_ceil(8)];
    for (index, signed) in bits.iter().enumerate() {
        if *signed {
            le[index / 8] |= 1 << (index % 8);
        }
    }
    while le.last() == Some(&0) {
        le.pop();
    }
    le.reverse();
    istanbul_extra(&le)
}
