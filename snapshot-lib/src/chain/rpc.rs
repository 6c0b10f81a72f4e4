use super::abi::{encode_call, Decoder, Token};
use super::{
    ChainClient, ChainError, ProposalQueue, RawBalance, RawGroup, RawGroupVotes, RawProposal,
    RawValidator, VoteTotals,
};
use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

const GET_ADDRESS_FOR_STRING: &str = "getAddressForStringOrDie(string)";

#[derive(Clone, Copy, Debug, Default)]
struct CoreContracts {
    validators: Address,
    accounts: Address,
    election: Address,
    governance: Address,
    gold_token: Address,
    stable_token: Address,
    locked_gold: Address,
}

#[derive(Serialize)]
struct Request<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct Response {
    #[serde(default)]
    result: Value,
    error: Option<ErrorObject>,
}

#[derive(Deserialize)]
struct ErrorObject {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Block {
    extra_data: String,
}

/// Chain access over a node's JSON-RPC endpoint. Core contract addresses are
/// resolved once through the registry when connecting.
pub struct JsonRpcChainClient {
    http: Client,
    url: Url,
    contracts: CoreContracts,
    next_id: AtomicU64,
}

impl JsonRpcChainClient {
    pub async fn connect(url: Url, registry: Address, timeout: Duration) -> Result<Self, ChainError> {
        let http = Client::builder().timeout(timeout).build()?;
        let mut client = Self {
            http,
            url,
            contracts: CoreContracts::default(),
            next_id: AtomicU64::new(1),
        };
        client.contracts = CoreContracts {
            validators: client.resolve(registry, "Validators").await?,
            accounts: client.resolve(registry, "Accounts").await?,
            election: client.resolve(registry, "Election").await?,
            governance: client.resolve(registry, "Governance").await?,
            gold_token: client.resolve(registry, "GoldToken").await?,
            stable_token: client.resolve(registry, "StableToken").await?,
            locked_gold: client.resolve(registry, "LockedGold").await?,
        };
        debug!(contracts = ?client.contracts, "resolved core contracts");
        Ok(client)
    }

    async fn resolve(&self, registry: Address, name: &str) -> Result<Address, ChainError> {
        let data = self
            .view(registry, GET_ADDRESS_FOR_STRING, &[Token::Str(name)])
            .await?;
        Decoder::new(GET_ADDRESS_FOR_STRING, &data).address(0)
    }

    async fn request<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, ChainError> {
        let request = Request {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        let response: Response = self
            .http
            .post(self.url.clone())
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if let Some(error) = response.error {
            return Err(ChainError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(serde_json::from_value(response.result)?)
    }

    async fn view(
        &self,
        to: Address,
        signature: &'static str,
        args: &[Token<'_>],
    ) -> Result<Vec<u8>, ChainError> {
        let data = format!("0x{}", hex::encode(encode_call(signature, args)));
        let result: String = self
            .request("eth_call", json!([{ "to": to, "data": data }, "latest"]))
            .await?;
        decode_hex(&result)
    }
}

fn decode_hex(value: &str) -> Result<Vec<u8>, ChainError> {
    Ok(hex::decode(value.trim_start_matches("0x"))?)
}

fn parse_quantity(value: &str) -> Result<u64, ChainError> {
    value
        .strip_prefix("0x")
        .and_then(|digits| u64::from_str_radix(digits, 16).ok())
        .ok_or_else(|| ChainError::Quantity(value.to_string()))
}

fn id_token(id: u64) -> Token<'static> {
    Token::Uint(U256::from(id))
}

#[async_trait]
impl ChainClient for JsonRpcChainClient {
    async fn block_number(&self) -> Result<u64, ChainError> {
        let quantity: String = self.request("eth_blockNumber", json!([])).await?;
        parse_quantity(&quantity)
    }

    async fn block_extra_data(&self, height: u64) -> Result<Vec<u8>, ChainError> {
        let block: Option<Block> = self
            .request(
                "eth_getBlockByNumber",
                json!([format!("{height:#x}"), false]),
            )
            .await?;
        let block = block.ok_or(ChainError::BlockNotFound(height))?;
        decode_hex(&block.extra_data)
    }

    async fn current_signers(&self) -> Result<Vec<Address>, ChainError> {
        const CALL: &str = "getCurrentValidatorSigners()";
        let data = self.view(self.contracts.election, CALL, &[]).await?;
        Decoder::new(CALL, &data).address_array(0)
    }

    async fn group_info(&self, group: Address) -> Result<RawGroup, ChainError> {
        const CALL: &str = "getValidatorGroup(address)";
        let data = self
            .view(self.contracts.validators, CALL, &[Token::Address(group)])
            .await?;
        let decoder = Decoder::new(CALL, &data);
        // word 4 is the offset of the size history, which is not tracked
        Ok(RawGroup {
            members: decoder.address_array(0)?,
            commission: decoder.uint(1)?,
            next_commission: decoder.uint(2)?,
            next_commission_block: decoder.uint(3)?,
            slashing_multiplier: decoder.uint(5)?,
            last_slashed: decoder.uint(6)?,
        })
    }

    async fn validator_info(&self, validator: Address) -> Result<RawValidator, ChainError> {
        const CALL: &str = "getValidator(address)";
        let data = self
            .view(self.contracts.validators, CALL, &[Token::Address(validator)])
            .await?;
        let decoder = Decoder::new(CALL, &data);
        Ok(RawValidator {
            affiliation: decoder.address(2)?,
            score: decoder.uint(3)?,
            signer: decoder.address(4)?,
        })
    }

    async fn account_name(&self, account: Address) -> Result<String, ChainError> {
        const CALL: &str = "getName(address)";
        let data = self
            .view(self.contracts.accounts, CALL, &[Token::Address(account)])
            .await?;
        Decoder::new(CALL, &data).string(0)
    }

    async fn vote_signer(&self, account: Address) -> Result<Address, ChainError> {
        const CALL: &str = "getVoteSigner(address)";
        let data = self
            .view(self.contracts.accounts, CALL, &[Token::Address(account)])
            .await?;
        Decoder::new(CALL, &data).address(0)
    }

    async fn metadata_url(&self, account: Address) -> Result<String, ChainError> {
        const CALL: &str = "getMetadataURL(address)";
        let data = self
            .view(self.contracts.accounts, CALL, &[Token::Address(account)])
            .await?;
        Decoder::new(CALL, &data).string(0)
    }

    async fn group_eligibility(&self, group: Address) -> Result<bool, ChainError> {
        const CALL: &str = "getGroupEligibility(address)";
        let data = self
            .view(self.contracts.election, CALL, &[Token::Address(group)])
            .await?;
        Decoder::new(CALL, &data).bool(0)
    }

    async fn group_votes(&self, group: Address) -> Result<RawGroupVotes, ChainError> {
        const TOTAL: &str = "getTotalVotesForGroup(address)";
        const ACTIVE: &str = "getActiveVotesForGroup(address)";
        const PENDING: &str = "getPendingVotesForGroup(address)";
        const RECEIVABLE: &str = "getNumVotesReceivable(address)";
        let election = self.contracts.election;
        let args = [Token::Address(group)];
        let (total, active, pending, receivable) = futures::try_join!(
            self.view(election, TOTAL, &args),
            self.view(election, ACTIVE, &args),
            self.view(election, PENDING, &args),
            self.view(election, RECEIVABLE, &args),
        )?;
        Ok(RawGroupVotes {
            total: Decoder::new(TOTAL, &total).uint(0)?,
            active: Decoder::new(ACTIVE, &active).uint(0)?,
            pending: Decoder::new(PENDING, &pending).uint(0)?,
            receivable: Decoder::new(RECEIVABLE, &receivable).uint(0)?,
        })
    }

    async fn proposal_count(&self) -> Result<u64, ChainError> {
        const CALL: &str = "proposalCount()";
        let data = self.view(self.contracts.governance, CALL, &[]).await?;
        Decoder::new(CALL, &data).u64(0)
    }

    async fn proposal(&self, id: u64) -> Result<RawProposal, ChainError> {
        const CALL: &str = "getProposal(uint256)";
        let data = self
            .view(self.contracts.governance, CALL, &[id_token(id)])
            .await?;
        let decoder = Decoder::new(CALL, &data);
        Ok(RawProposal {
            proposer: decoder.address(0)?,
            deposit: decoder.uint(1)?,
            timestamp: decoder.uint(2)?,
            transaction_count: decoder.uint(3)?,
            description_url: decoder.string(4)?,
        })
    }

    async fn proposal_stage(&self, id: u64) -> Result<u64, ChainError> {
        const CALL: &str = "getProposalStage(uint256)";
        let data = self
            .view(self.contracts.governance, CALL, &[id_token(id)])
            .await?;
        Decoder::new(CALL, &data).u64(0)
    }

    async fn vote_totals(&self, id: u64) -> Result<VoteTotals, ChainError> {
        const CALL: &str = "getVoteTotals(uint256)";
        let data = self
            .view(self.contracts.governance, CALL, &[id_token(id)])
            .await?;
        let decoder = Decoder::new(CALL, &data);
        Ok(VoteTotals {
            yes: decoder.uint(0)?,
            no: decoder.uint(1)?,
            abstain: decoder.uint(2)?,
        })
    }

    async fn queue(&self) -> Result<ProposalQueue, ChainError> {
        const CALL: &str = "getQueue()";
        let data = self.view(self.contracts.governance, CALL, &[]).await?;
        let decoder = Decoder::new(CALL, &data);
        Ok(ProposalQueue {
            ids: decoder.uint_array(0)?,
            upvotes: decoder.uint_array(1)?,
        })
    }

    async fn dequeue(&self) -> Result<Vec<U256>, ChainError> {
        const CALL: &str = "getDequeue()";
        let data = self.view(self.contracts.governance, CALL, &[]).await?;
        Decoder::new(CALL, &data).uint_array(0)
    }

    async fn is_approved(&self, id: u64) -> Result<bool, ChainError> {
        const CALL: &str = "isApproved(uint256)";
        let data = self
            .view(self.contracts.governance, CALL, &[id_token(id)])
            .await?;
        Decoder::new(CALL, &data).bool(0)
    }

    async fn account_balance(&self, account: Address) -> Result<RawBalance, ChainError> {
        const BALANCE: &str = "balanceOf(address)";
        const LOCKED: &str = "getAccountTotalLockedGold(address)";
        const PENDING: &str = "getTotalPendingWithdrawals(address)";
        let args = [Token::Address(account)];
        let (celo, cusd, locked_celo, pending) = futures::try_join!(
            self.view(self.contracts.gold_token, BALANCE, &args),
            self.view(self.contracts.stable_token, BALANCE, &args),
            self.view(self.contracts.locked_gold, LOCKED, &args),
            self.view(self.contracts.locked_gold, PENDING, &args),
        )?;
        Ok(RawBalance {
            celo: Decoder::new(BALANCE, &celo).uint(0)?,
            cusd: Decoder::new(BALANCE, &cusd).uint(0)?,
            locked_celo: Decoder::new(LOCKED, &locked_celo).uint(0)?,
            pending: Decoder::new(PENDING, &pending).uint(0)?,
        })
    }
}
