// Standard library imports
use std::{future::Future, sync::Arc, time::Duration};

// Third party imports
use async_trait::async_trait;
use ethers::{
    providers::{Http, Middleware, Provider, ProviderError, RpcError as _},
    types::{Address, Block, BlockId, BlockNumber, Bytes, Transaction, TransactionReceipt, H256, U256},
};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

// Internal imports
use flood_common::error::RpcError;

/// Minimal JSON-RPC surface the dispatch substrate needs from a node.
///
/// Everything above this trait is written against it so pools and the dispatch
/// engine can be exercised against an in-memory chain.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RpcClient: Send + Sync + 'static {
    async fn chain_id(&self) -> Result<u64, RpcError>;

    async fn block_number(&self) -> Result<u64, RpcError>;

    /// Block with full transaction objects
    async fn block_with_txs(&self, number: u64) -> Result<Option<Block<Transaction>>, RpcError>;

    async fn block_receipts(&self, number: u64) -> Result<Vec<TransactionReceipt>, RpcError>;

    async fn transaction_receipt(&self, hash: H256) -> Result<Option<TransactionReceipt>, RpcError>;

    /// Transaction count at the latest block, or including the node's pool when `pending`
    async fn nonce(&self, address: Address, pending: bool) -> Result<u64, RpcError>;

    async fn balance(&self, address: Address) -> Result<U256, RpcError>;

    /// `eth_gasPrice`
    async fn gas_price(&self) -> Result<U256, RpcError>;

    /// `eth_maxPriorityFeePerGas`
    async fn max_priority_fee(&self) -> Result<U256, RpcError>;

    /// Base fee of the latest block, `None` before London
    async fn base_fee(&self) -> Result<Option<U256>, RpcError>;

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, RpcError>;

    /// Underlying provider for calls this trait does not cover
    fn provider(&self) -> Option<Arc<Provider<Http>>> {
        None
    }
}

/// [`RpcClient`] backed by an `ethers` HTTP provider
#[derive(Debug, Clone)]
pub struct EthersClient {
    provider: Arc<Provider<Http>>,
    timeout: Duration,
}

impl EthersClient {
    /// Builds a client for `url`, attaching `headers` to every request
    pub fn new(url: &str, headers: &[(String, String)], timeout: Duration) -> Result<Self, RpcError> {
        let url = reqwest::Url::parse(url)
            .map_err(|e| RpcError::Connection(format!("invalid url {url}: {e}")))?;

        let mut header_map = HeaderMap::new();
        for (key, value) in headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| RpcError::Connection(format!("invalid header name {key}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| RpcError::Connection(format!("invalid header value for {key}: {e}")))?;
            header_map.insert(name, value);
        }

        let http_client = reqwest::Client::builder()
            .default_headers(header_map)
            .timeout(timeout)
            .build()
            .map_err(|e| RpcError::Connection(e.to_string()))?;

        let provider = Provider::new(Http::new_with_client(url, http_client));
        Ok(Self {
            provider: Arc::new(provider),
            timeout,
        })
    }

    async fn call<T, F>(&self, request: F) -> Result<T, RpcError>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        match tokio::time::timeout(self.timeout, request).await {
            Ok(result) => result.map_err(map_provider_error),
            Err(_) => Err(RpcError::Timeout(self.timeout)),
        }
    }
}

fn map_provider_error(err: ProviderError) -> RpcError {
    if let Some(response) = err.as_error_response() {
        return RpcError::Rejected {
            code: response.code,
            message: response.message.clone(),
        };
    }
    if err.as_serde_error().is_some() {
        return RpcError::Decode(err.to_string());
    }
    RpcError::Connection(err.to_string())
}

#[async_trait]
impl RpcClient for EthersClient {
    async fn chain_id(&self) -> Result<u64, RpcError> {
        self.call(self.provider.get_chainid()).await.map(|id| id.as_u64())
    }

    async fn block_number(&self) -> Result<u64, RpcError> {
        self.call(self.provider.get_block_number()).await.map(|n| n.as_u64())
    }

    async fn block_with_txs(&self, number: u64) -> Result<Option<Block<Transaction>>, RpcError> {
        self.call(self.provider.get_block_with_txs(number)).await
    }

    async fn block_receipts(&self, number: u64) -> Result<Vec<TransactionReceipt>, RpcError> {
        self.call(self.provider.get_block_receipts(number)).await
    }

    async fn transaction_receipt(&self, hash: H256) -> Result<Option<TransactionReceipt>, RpcError> {
        self.call(self.provider.get_transaction_receipt(hash)).await
    }

    async fn nonce(&self, address: Address, pending: bool) -> Result<u64, RpcError> {
        let block: BlockId = if pending {
            BlockNumber::Pending.into()
        } else {
            BlockNumber::Latest.into()
        };
        self.call(self.provider.get_transaction_count(address, Some(block)))
            .await
            .map(|n| n.as_u64())
    }

    async fn balance(&self, address: Address) -> Result<U256, RpcError> {
        self.call(self.provider.get_balance(address, None)).await
    }

    async fn gas_price(&self) -> Result<U256, RpcError> {
        self.call(self.provider.get_gas_price()).await
    }

    async fn max_priority_fee(&self) -> Result<U256, RpcError> {
        self.call(self.provider.request::<_, U256>("eth_maxPriorityFeePerGas", ()))
            .await
    }

    async fn base_fee(&self) -> Result<Option<U256>, RpcError> {
        self.call(self.provider.get_block(BlockNumber::Latest))
            .await
            .map(|block| block.and_then(|b| b.base_fee_per_gas))
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, RpcError> {
        let pending = self.call(self.provider.send_raw_transaction(raw)).await?;
        Ok(pending.tx_hash())
    }

    fn provider(&self) -> Option<Arc<Provider<Http>>> {
        Some(self.provider.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_invalid_url() {
        let err = EthersClient::new("not a url", &[], Duration::from_secs(1)).unwrap_err();
        assert!(err.is_connectivity());
    }

    #[test]
    fn test_accepts_headers() {
        let headers = vec![("Authorization".to_string(), "Bearer abc".to_string())];
        let client = EthersClient::new("http://127.0.0.1:8545", &headers, Duration::from_secs(1)).unwrap();
        assert!(client.provider().is_some());
    }

    #[test]
    fn test_rejects_invalid_header() {
        let headers = vec![("bad header".to_string(), "x".to_string())];
        assert!(EthersClient::new("http://127.0.0.1:8545", &headers, Duration::from_secs(1)).is_err());
    }
}
