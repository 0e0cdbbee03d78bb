// Copyright (c) GridEx, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Chain RPC capabilities and the rate-limited wrapper.
//!
//! The scanner consumes the small [`ChainRpc`] capability set rather than a
//! concrete provider, so the real client, the rate-limited wrapper and the
//! test doubles are interchangeable.

use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Block, Bytes, Filter, Log, TransactionReceipt, TransactionRequest, TxHash};
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{IndexerError, IndexerResult};

/// The subset of chain RPC operations the scanner depends on.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Most recent block number.
    async fn block_number(&self) -> IndexerResult<u64>;

    /// Execute a log filter query.
    async fn get_logs(&self, filter: &Filter) -> IndexerResult<Vec<Log>>;

    /// Fetch a block (with transaction hashes) by number.
    async fn block_by_number(&self, number: u64) -> IndexerResult<Option<Block<TxHash>>>;

    /// Fetch a transaction receipt by hash.
    async fn transaction_receipt(
        &self,
        tx_hash: TxHash,
    ) -> IndexerResult<Option<TransactionReceipt>>;

    /// Execute a read-only contract call.
    async fn call(&self, to: Address, data: Bytes) -> IndexerResult<Bytes>;
}

/// Real chain client over an HTTP JSON-RPC provider.
pub struct EthRpcClient {
    provider: Provider<Http>,
}

impl EthRpcClient {
    pub fn new(rpc_url: &str) -> IndexerResult<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| IndexerError::Rpc(format!("invalid rpc url {rpc_url}: {e}")))?;
        Ok(Self { provider })
    }
}

#[async_trait]
impl ChainRpc for EthRpcClient {
    async fn block_number(&self) -> IndexerResult<u64> {
        Ok(self.provider.get_block_number().await?.as_u64())
    }

    async fn get_logs(&self, filter: &Filter) -> IndexerResult<Vec<Log>> {
        Ok(self.provider.get_logs(filter).await?)
    }

    async fn block_by_number(&self, number: u64) -> IndexerResult<Option<Block<TxHash>>> {
        Ok(self.provider.get_block(number).await?)
    }

    async fn transaction_receipt(
        &self,
        tx_hash: TxHash,
    ) -> IndexerResult<Option<TransactionReceipt>> {
        Ok(self.provider.get_transaction_receipt(tx_hash).await?)
    }

    async fn call(&self, to: Address, data: Bytes) -> IndexerResult<Bytes> {
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
        Ok(self.provider.call(&tx, None).await?)
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket admitting `rpm / 60` operations per second with burst
/// `max(1, rpm / 10)`. Waiters reserve a token up front (the balance may go
/// negative), which keeps concurrent callers queued in FIFO-ish order.
struct TokenBucket {
    rate_per_sec: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    fn new(rpm: u32) -> Self {
        let rate_per_sec = f64::from(rpm) / 60.0;
        let burst = f64::from((rpm / 10).max(1));
        Self {
            rate_per_sec,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, sleeping until it is available. Fails with
    /// [`IndexerError::Cancelled`] when the token is cancelled first.
    async fn acquire(&self, cancel: &CancellationToken) -> IndexerResult<()> {
        let wait = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let elapsed = now.duration_since(state.last_refill).as_secs_f64();
            state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.burst);
            state.last_refill = now;

            state.tokens -= 1.0;
            if state.tokens >= 0.0 {
                return Ok(());
            }
            Duration::from_secs_f64(-state.tokens / self.rate_per_sec)
        };

        tokio::select! {
            _ = tokio::time::sleep(wait) => Ok(()),
            _ = cancel.cancelled() => Err(IndexerError::Cancelled),
        }
    }
}

/// Wraps any [`ChainRpc`] implementation with a token-bucket rate limiter.
///
/// Every capability waits on the bucket before delegating. This includes the
/// cheap `eth_blockNumber` probe: free-tier providers meter all requests.
/// `rpm == 0` disables limiting entirely.
pub struct RateLimitedClient<C> {
    inner: C,
    bucket: Option<TokenBucket>,
    cancel: CancellationToken,
}

impl<C: ChainRpc> RateLimitedClient<C> {
    pub fn new(inner: C, rpm: u32, cancel: CancellationToken) -> Self {
        let bucket = (rpm > 0).then(|| TokenBucket::new(rpm));
        Self {
            inner,
            bucket,
            cancel,
        }
    }

    async fn wait(&self) -> IndexerResult<()> {
        match &self.bucket {
            Some(bucket) => bucket.acquire(&self.cancel).await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl<C: ChainRpc> ChainRpc for RateLimitedClient<C> {
    async fn block_number(&self) -> IndexerResult<u64> {
        self.wait().await?;
        self.inner.block_number().await
    }

    async fn get_logs(&self, filter: &Filter) -> IndexerResult<Vec<Log>> {
        self.wait().await?;
        self.inner.get_logs(filter).await
    }

    async fn block_by_number(&self, number: u64) -> IndexerResult<Option<Block<TxHash>>> {
        self.wait().await?;
        self.inner.block_by_number(number).await
    }

    async fn transaction_receipt(
        &self,
        tx_hash: TxHash,
    ) -> IndexerResult<Option<TransactionReceipt>> {
        self.wait().await?;
        self.inner.transaction_receipt(tx_hash).await
    }

    async fn call(&self, to: Address, data: Bytes) -> IndexerResult<Bytes> {
        self.wait().await?;
        self.inner.call(to, data).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Test double that answers `block_number` and counts calls.
    pub(crate) struct CountingRpc {
        pub calls: AtomicU64,
    }

    impl CountingRpc {
        pub fn new() -> Self {
            Self {
                calls: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl ChainRpc for CountingRpc {
        async fn block_number(&self) -> IndexerResult<u64> {
            Ok(self.calls.fetch_add(1, Ordering::SeqCst) + 1)
        }

        async fn get_logs(&self, _filter: &Filter) -> IndexerResult<Vec<Log>> {
            Ok(vec![])
        }

        async fn block_by_number(&self, _number: u64) -> IndexerResult<Option<Block<TxHash>>> {
            Ok(None)
        }

        async fn transaction_receipt(
            &self,
            _tx_hash: TxHash,
        ) -> IndexerResult<Option<TransactionReceipt>> {
            Ok(None)
        }

        async fn call(&self, _to: Address, _data: Bytes) -> IndexerResult<Bytes> {
            Ok(Bytes::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_paces_calls() {
        // rpc_tpm=60 -> 1 op/sec, burst 6. Twenty back-to-back calls should
        // admit 6 immediately and pace the remaining 14 at one per second.
        let client = RateLimitedClient::new(CountingRpc::new(), 60, CancellationToken::new());

        let start = Instant::now();
        for _ in 0..20 {
            client.block_number().await.unwrap();
        }
        let elapsed = start.elapsed();

        assert!(
            elapsed >= Duration::from_secs(14),
            "20 calls finished too fast: {elapsed:?}"
        );
        assert!(
            elapsed <= Duration::from_secs(16),
            "20 calls took too long: {elapsed:?}"
        );
        assert_eq!(client.inner.calls.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn test_zero_tpm_is_unlimited() {
        let client = RateLimitedClient::new(CountingRpc::new(), 0, CancellationToken::new());
        let start = std::time::Instant::now();
        for _ in 0..100 {
            client.block_number().await.unwrap();
        }
        assert!(start.elapsed() < std::time::Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_while_waiting() {
        let cancel = CancellationToken::new();
        let client = RateLimitedClient::new(CountingRpc::new(), 60, cancel.clone());

        // Drain the burst.
        for _ in 0..6 {
            client.block_number().await.unwrap();
        }

        cancel.cancel();
        let err = client.block_number().await.unwrap_err();
        assert!(matches!(err, IndexerError::Cancelled));
    }
}
