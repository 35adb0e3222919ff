//! Read access to the ledger.

use {
    alloy::{
        eips::BlockId,
        primitives::{Address, Bytes, U256},
        providers::{DynProvider, Provider},
        rpc::{client::BatchRequest, types::TransactionRequest},
        sol,
        sol_types::SolCall,
    },
    anyhow::{Context, Result},
    futures::future::try_join_all,
};

sol! {
    #[sol(rpc)]
    interface IERC20 {
        function balanceOf(address owner) external view returns (uint256);
        function allowance(address owner, address spender) external view returns (uint256);
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct BalanceQuery {
    pub owner: Address,
    pub token: Address,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct AllowanceQuery {
    pub owner: Address,
    pub token: Address,
    pub spender: Address,
}

/// Batched chain reads. Every call is one logical batch that either succeeds
/// for all queries or fails as a whole, results are in query order.
#[cfg_attr(any(test, feature = "test-util"), mockall::automock)]
#[async_trait::async_trait]
pub trait ChainAccessor: Send + Sync {
    async fn balances(&self, queries: &[BalanceQuery]) -> Result<Vec<U256>>;

    async fn allowances(&self, queries: &[AllowanceQuery]) -> Result<Vec<U256>>;

    /// Balance of the chain's native asset.
    async fn native_balance(&self, owner: Address) -> Result<U256>;
}

/// [`ChainAccessor`] talking to an ethereum node over JSON-RPC.
pub struct Node {
    provider: DynProvider,
}

impl Node {
    pub fn new(provider: DynProvider) -> Self {
        Self { provider }
    }

    pub fn connect(url: &url::Url) -> Self {
        let provider = alloy::providers::ProviderBuilder::new()
            .connect_http(url.clone())
            .erased();
        Self::new(provider)
    }

    /// Sends all calls as a single JSON-RPC batch against the latest block.
    /// Fails if any call fails.
    async fn batch_call<C>(&self, calls: Vec<(Address, C)>) -> Result<Vec<C::Return>>
    where
        C: SolCall + Send + Sync,
    {
        if calls.is_empty() {
            return Ok(Vec::new());
        }
        let mut batch = BatchRequest::new(self.provider.client());
        let waiters = calls
            .iter()
            .map(|(to, call)| {
                let request = TransactionRequest::default()
                    .to(*to)
                    .input(call.abi_encode().into());
                batch.add_call::<_, Bytes>("eth_call", &(request, BlockId::latest()))
            })
            .collect::<Result<Vec<_>, _>>()
            .context("encode eth_call batch")?;
        batch.send().await.context("send eth_call batch")?;

        let outputs = try_join_all(waiters).await.context("eth_call in batch")?;
        outputs
            .iter()
            .map(|output| C::abi_decode_returns(output).context("decode eth_call output"))
            .collect()
    }
}

#[async_trait::async_trait]
impl ChainAccessor for Node {
    async fn balances(&self, queries: &[BalanceQuery]) -> Result<Vec<U256>> {
        let calls = queries
            .iter()
            .map(|query| {
                (query.token, IERC20::balanceOfCall {
                    owner: query.owner,
                })
            })
            .collect();
        self.batch_call(calls)
            .await
            .with_context(|| format!("balanceOf for {} queries", queries.len()))
    }

    async fn allowances(&self, queries: &[AllowanceQuery]) -> Result<Vec<U256>> {
        let calls = queries
            .iter()
            .map(|query| {
                (query.token, IERC20::allowanceCall {
                    owner: query.owner,
                    spender: query.spender,
                })
            })
            .collect();
        self.batch_call(calls)
            .await
            .with_context(|| format!("allowance for {} queries", queries.len()))
    }

    async fn native_balance(&self, owner: Address) -> Result<U256> {
        self.provider
            .get_balance(owner)
            .await
            .with_context(|| format!("native balance of {owner}"))
    }
}
