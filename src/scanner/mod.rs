// Copyright (c) GridEx, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-chain scan loop.
//!
//! One scanner owns one chain: it tracks the chain tip with a confirmation
//! lag, pulls logs for bounded block windows through the adaptive fetcher,
//! and applies every batch in a single database transaction together with
//! the cursor advance, the aggregate refreshes and the Kafka publish.

mod handlers;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use diesel_async::scoped_futures::ScopedFutureExt;
use ethers::types::{Address, Filter, Log};
use futures::future::BoxFuture;
use futures::FutureExt;
use num_bigint::BigInt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ChainConfig;
use crate::contracts::{Caller, TokenInfo};
use crate::db::models::NewToken;
use crate::db::{repository, stats, Db};
use crate::error::{IndexerError, IndexerResult};
use crate::kafka::{KafkaProducer, Message};
use crate::rpc::ChainRpc;

/// Refresh the cached tip only when the cursor is within this many blocks of
/// it; while far behind, the cached value is good enough and the probe would
/// waste rate-limited requests.
const TIP_REFRESH_MARGIN: u64 = 100;

/// Price0 and gap halves delivered by `LinearStrategyCreated`, keyed by grid
/// id and consumed by the following `GridOrderCreated` in the same
/// transaction. There can be two events per grid: one ask side, one bid side.
#[derive(Debug, Default)]
pub(crate) struct StrategyInfo {
    pub ask_price0: Option<BigInt>,
    pub ask_gap: Option<BigInt>,
    pub bid_price0: Option<BigInt>,
    pub bid_gap: Option<BigInt>,
}

/// True when an RPC error indicates the log query exceeded the node's limits
/// (response size, block range, or result count). Different providers word
/// this differently.
pub(crate) fn is_range_too_wide(message: &str) -> bool {
    const MARKERS: [&str; 7] = [
        "limit exceeded",
        "query returned more than",
        "too many results",
        "block range too large",
        "exceed maximum block range",
        "response size is too large",
        "log response size exceeded",
    ];
    let message = message.to_lowercase();
    MARKERS.iter().any(|m| message.contains(m))
}

/// Pulls logs for block ranges, shrinking the query adaptively when the node
/// refuses to answer.
pub(crate) struct LogFetcher<C> {
    client: Arc<C>,
    gridex_addr: Address,
    strategy_addr: Address,
}

impl<C: ChainRpc> LogFetcher<C> {
    pub fn new(client: Arc<C>, gridex_addr: Address, strategy_addr: Address) -> Self {
        Self {
            client,
            gridex_addr,
            strategy_addr,
        }
    }

    /// Fetch all exchange and strategy contract logs in `[from, to]`,
    /// bisecting on range-too-wide errors. A single block that still exceeds
    /// the limit is fetched per-address, and as a last resort from receipts.
    pub fn fetch_adaptive(&self, from: u64, to: u64) -> BoxFuture<'_, IndexerResult<Vec<Log>>> {
        async move {
            let err = match self.fetch_range(from, to).await {
                Ok(logs) => return Ok(logs),
                Err(err) => err,
            };

            if matches!(err, IndexerError::Cancelled) || !is_range_too_wide(&err.to_string()) {
                return Err(err);
            }

            warn!(from, to, error = %err, "log query exceeded node limits");

            if from == to {
                warn!(block = from, "single block exceeds log limit, fetching per-address");
                return self.fetch_single_block_per_address(from).await;
            }

            let mid = from + (to - from) / 2;
            warn!(from, to, mid, "splitting block range");

            let mut logs = self.fetch_adaptive(from, mid).await?;
            logs.extend(self.fetch_adaptive(mid + 1, to).await?);
            Ok(logs)
        }
        .boxed()
    }

    /// One range query over both contract addresses, no topic filter: every
    /// event those contracts emit is captured.
    async fn fetch_range(&self, from: u64, to: u64) -> IndexerResult<Vec<Log>> {
        let filter = Filter::new()
            .from_block(from)
            .to_block(to)
            .address(vec![self.gridex_addr, self.strategy_addr]);
        self.client.get_logs(&filter).await
    }

    /// Per-address queries for one block. Falls back to receipt scanning if
    /// even a single address exceeds the limit.
    async fn fetch_single_block_per_address(&self, block: u64) -> IndexerResult<Vec<Log>> {
        let mut all_logs = Vec::new();

        for addr in [self.gridex_addr, self.strategy_addr] {
            let filter = Filter::new()
                .from_block(block)
                .to_block(block)
                .address(addr);
            match self.client.get_logs(&filter).await {
                Ok(logs) => all_logs.extend(logs),
                Err(IndexerError::Cancelled) => return Err(IndexerError::Cancelled),
                Err(err) if is_range_too_wide(&err.to_string()) => {
                    warn!(
                        block,
                        address = ?addr,
                        "per-address query still exceeds limit, scanning receipts"
                    );
                    return self.fetch_from_receipts(block).await;
                }
                Err(err) => return Err(err),
            }
        }

        sort_logs(&mut all_logs);
        Ok(all_logs)
    }

    /// Last-resort fallback: fetch the block, walk every transaction receipt
    /// and keep the logs emitted by our contracts. Avoids eth_getLogs
    /// entirely.
    async fn fetch_from_receipts(&self, block_number: u64) -> IndexerResult<Vec<Log>> {
        info!(block = block_number, "fetching logs from receipts");

        let block = self
            .client
            .block_by_number(block_number)
            .await?
            .ok_or_else(|| IndexerError::Rpc(format!("block {block_number} not found")))?;

        let address_set: HashSet<Address> =
            HashSet::from([self.gridex_addr, self.strategy_addr]);

        let mut all_logs = Vec::new();
        for tx_hash in &block.transactions {
            let receipt = self
                .client
                .transaction_receipt(*tx_hash)
                .await?
                .ok_or_else(|| {
                    IndexerError::Rpc(format!(
                        "missing receipt for tx {tx_hash:?} in block {block_number}"
                    ))
                })?;
            all_logs.extend(
                receipt
                    .logs
                    .into_iter()
                    .filter(|log| address_set.contains(&log.address)),
            );
        }

        info!(
            block = block_number,
            transactions = block.transactions.len(),
            matched_logs = all_logs.len(),
            "extracted logs from receipts"
        );

        sort_logs(&mut all_logs);
        Ok(all_logs)
    }
}

/// Sort logs by `(block_number, tx_index, log_index)` so events are applied
/// in chain order after merging per-address or per-receipt results.
pub(crate) fn sort_logs(logs: &mut [Log]) {
    logs.sort_by_key(|log| {
        (
            log.block_number.unwrap_or_default().as_u64(),
            log.transaction_index.unwrap_or_default().as_u64(),
            log.log_index.unwrap_or_default().as_u64(),
        )
    });
}

/// Scans a single chain for GridEx events.
pub struct Scanner<C> {
    cfg: ChainConfig,
    chain_id: i64,
    client: Arc<C>,
    fetcher: LogFetcher<C>,
    caller: Caller<C>,
    db: Db,
    producer: Arc<KafkaProducer>,
    cancel: CancellationToken,

    /// Avoids repeated on-chain metadata calls for the same token.
    token_cache: HashMap<Address, TokenInfo>,
    /// LinearStrategyCreated halves awaiting their GridOrderCreated,
    /// keyed by the grid id's decimal string.
    strategy_cache: HashMap<String, StrategyInfo>,
}

impl<C: ChainRpc> Scanner<C> {
    pub fn new(
        cfg: ChainConfig,
        client: Arc<C>,
        db: Db,
        producer: Arc<KafkaProducer>,
        cancel: CancellationToken,
    ) -> IndexerResult<Self> {
        let gridex_addr = cfg
            .gridex_addr()
            .map_err(|e| IndexerError::Config(e.to_string()))?;
        let strategy_addr = cfg
            .linear_strategy_addr()
            .map_err(|e| IndexerError::Config(e.to_string()))?;

        Ok(Self {
            chain_id: cfg.chain_id,
            fetcher: LogFetcher::new(client.clone(), gridex_addr, strategy_addr),
            caller: Caller::new(client.clone(), gridex_addr),
            client,
            cfg,
            db,
            producer,
            cancel,
            token_cache: HashMap::new(),
            strategy_cache: HashMap::new(),
        })
    }

    /// Run the scanning loop until the cancellation token fires.
    pub async fn run(mut self) -> IndexerResult<()> {
        // Pre-populate the token cache from the database. On restart against
        // a rate-limited RPC this saves three calls per already-known token.
        if let Err(e) = self.load_token_cache().await {
            warn!(error = %e, "failed to pre-populate token cache, will fetch from chain");
        }

        let last_block = {
            let mut conn = self.db.connect().await?;
            repository::last_block(&mut conn, self.chain_id).await?
        };
        let mut current = self.cfg.start_block.max(last_block.saturating_add(1));

        info!(start_block = current, "starting scanner");

        let poll_interval = self.cfg.poll_interval();
        let mut latest_block: u64 = 0;

        loop {
            if self.cancel.is_cancelled() {
                info!("scanner stopped");
                return Ok(());
            }

            // Only probe the tip when close to it (or on the first
            // iteration); the probe costs a rate-limited request.
            if latest_block == 0 || latest_block < current + TIP_REFRESH_MARGIN {
                match self.client.block_number().await {
                    Ok(number) => latest_block = number,
                    Err(IndexerError::Cancelled) => continue,
                    Err(e) => {
                        error!(error = %e, "failed to get latest block");
                        self.sleep_cancellable(poll_interval).await;
                        continue;
                    }
                }
            }

            let safe_block = latest_block.saturating_sub(self.cfg.confirmations);
            if current > safe_block {
                // Caught up, wait for new blocks.
                self.sleep_cancellable(poll_interval).await;
                continue;
            }

            let end_block = (current + self.cfg.block_batch_size - 1).min(safe_block);
            info!(from = current, to = end_block, latest = latest_block, "scanning blocks");

            let logs = match self.fetcher.fetch_adaptive(current, end_block).await {
                Ok(logs) => logs,
                Err(IndexerError::Cancelled) => continue,
                Err(e) => {
                    error!(from = current, to = end_block, error = %e, "failed to fetch logs");
                    self.sleep_cancellable(poll_interval).await;
                    continue;
                }
            };

            match self.process_logs(&logs, end_block).await {
                Ok(()) => {
                    info!(
                        from = current,
                        to = end_block,
                        events = logs.len(),
                        "processed blocks"
                    );
                    current = end_block + 1;
                }
                Err(IndexerError::Cancelled) => continue,
                Err(e) => {
                    error!(from = current, to = end_block, error = %e, "failed to process logs");
                    self.sleep_cancellable(poll_interval).await;
                }
            }
        }
    }

    /// Sleep for `duration`, returning early (true) when cancelled.
    async fn sleep_cancellable(&self, duration: std::time::Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.cancel.cancelled() => true,
        }
    }

    /// Apply a batch of logs in one transaction: event writes, cursor
    /// advance, aggregate refreshes, Kafka publish and offset bookkeeping
    /// either all commit or none do.
    async fn process_logs(&mut self, logs: &[Log], end_block: u64) -> IndexerResult<()> {
        let db = self.db.clone();
        let producer = self.producer.clone();
        let chain_id = self.chain_id;

        db.transaction(|conn| {
            async move {
                let mut messages: Vec<Message> = Vec::new();

                for log in logs {
                    if log.topics.is_empty() {
                        continue;
                    }
                    let msgs = match self.process_log(conn, log).await {
                        Ok(msgs) => msgs,
                        Err(e) => {
                            if !matches!(e, IndexerError::Cancelled) {
                                error!(
                                    block = log.block_number.unwrap_or_default().as_u64(),
                                    tx_index = log.transaction_index.unwrap_or_default().as_u64(),
                                    log_index = log.log_index.unwrap_or_default().as_u64(),
                                    error = %e,
                                    "failed to process log"
                                );
                            }
                            return Err(e);
                        }
                    };
                    messages.extend(msgs);
                }

                repository::update_last_block(conn, chain_id, end_block).await?;

                // Aggregate refreshes are best-effort: indexing never stalls
                // on statistics.
                if let Err(e) = stats::refresh_protocol_stats(conn, chain_id, end_block).await {
                    warn!(error = %e, "failed to update protocol stats");
                }
                if let Err(e) = stats::refresh_pair_stats(conn, chain_id, end_block).await {
                    warn!(error = %e, "failed to update pair stats");
                }
                if let Err(e) = stats::refresh_leaderboard(conn, chain_id, end_block).await {
                    warn!(error = %e, "failed to update leaderboard");
                }

                // Publish before commit: a failed publish rolls the batch
                // back, so cursor and bus never diverge by more than a
                // replay.
                if !messages.is_empty() {
                    producer.send_batch(&messages).await?;

                    match producer.tail_offset() {
                        Ok(offset) if offset > 0 => {
                            if let Err(e) =
                                repository::update_kafka_offset(conn, chain_id, offset).await
                            {
                                warn!(error = %e, "failed to store kafka offset");
                            }
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "failed to read kafka tail offset"),
                    }
                }

                Ok(())
            }
            .scope_boxed()
        })
        .await
    }

    /// Token metadata, from cache when available; fetched and persisted
    /// otherwise.
    pub(crate) async fn get_or_fetch_token(
        &mut self,
        conn: &mut diesel_async::AsyncPgConnection,
        addr: Address,
        block_number: u64,
    ) -> IndexerResult<TokenInfo> {
        if let Some(info) = self.token_cache.get(&addr) {
            return Ok(info.clone());
        }

        let info = self.caller.get_token_info(addr).await?;
        self.token_cache.insert(addr, info.clone());

        repository::upsert_token(
            conn,
            &NewToken {
                chain_id: self.chain_id,
                address: format!("{addr:?}"),
                symbol: info.symbol.clone(),
                name: info.name.clone(),
                decimals: i32::from(info.decimals),
                logo: String::new(),
                create_block: block_number as i64,
                update_block: block_number as i64,
            },
        )
        .await?;

        Ok(info)
    }

    async fn load_token_cache(&mut self) -> IndexerResult<()> {
        let mut conn = self.db.connect().await?;
        let rows = repository::tokens_by_chain(&mut conn, self.chain_id).await?;
        let count = rows.len();

        for row in rows {
            let Ok(addr) = row.address.parse::<Address>() else {
                warn!(address = %row.address, "skipping malformed token address");
                continue;
            };
            self.token_cache.insert(
                addr,
                TokenInfo {
                    address: addr,
                    name: row.name,
                    symbol: row.symbol,
                    decimals: row.decimals.clamp(0, 255) as u8,
                },
            );
        }

        info!(count, "pre-populated token cache");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ethers::types::{Block, Bytes, TransactionReceipt, TxHash, ValueOrArray, H256};
    use std::collections::HashMap;
    use std::sync::Mutex;

    type FilterLogsFn = Box<dyn Fn(u64, u64, Vec<Address>) -> IndexerResult<Vec<Log>> + Send + Sync>;
    type BlockFn = Box<dyn Fn(u64) -> IndexerResult<Option<Block<TxHash>>> + Send + Sync>;
    type ReceiptFn = Box<dyn Fn(TxHash) -> IndexerResult<Option<TransactionReceipt>> + Send + Sync>;

    /// Closure-driven test double for the RPC capability set.
    #[derive(Default)]
    struct MockRpc {
        filter_logs: Option<FilterLogsFn>,
        block_by_number: Option<BlockFn>,
        transaction_receipt: Option<ReceiptFn>,
    }

    fn filter_addresses(filter: &Filter) -> Vec<Address> {
        match &filter.address {
            Some(ValueOrArray::Value(a)) => vec![*a],
            Some(ValueOrArray::Array(v)) => v.clone(),
            None => vec![],
        }
    }

    #[async_trait]
    impl ChainRpc for MockRpc {
        async fn block_number(&self) -> IndexerResult<u64> {
            panic!("block_number not mocked");
        }

        async fn get_logs(&self, filter: &Filter) -> IndexerResult<Vec<Log>> {
            let f = self.filter_logs.as_ref().expect("get_logs not mocked");
            let from = filter.get_from_block().expect("from_block set").as_u64();
            let to = filter.get_to_block().expect("to_block set").as_u64();
            f(from, to, filter_addresses(filter))
        }

        async fn block_by_number(&self, number: u64) -> IndexerResult<Option<Block<TxHash>>> {
            let f = self
                .block_by_number
                .as_ref()
                .expect("block_by_number not mocked");
            f(number)
        }

        async fn transaction_receipt(
            &self,
            tx_hash: TxHash,
        ) -> IndexerResult<Option<TransactionReceipt>> {
            let f = self
                .transaction_receipt
                .as_ref()
                .expect("transaction_receipt not mocked");
            f(tx_hash)
        }

        async fn call(&self, _to: Address, _data: Bytes) -> IndexerResult<Bytes> {
            panic!("call not mocked");
        }
    }

    fn test_log(block: u64, tx_index: u64, log_index: u64) -> Log {
        Log {
            block_number: Some(block.into()),
            transaction_index: Some(tx_index.into()),
            log_index: Some(log_index.into()),
            ..Default::default()
        }
    }

    const GRID: Address = Address::repeat_byte(1);
    const STRATEGY: Address = Address::repeat_byte(2);

    fn fetcher(mock: MockRpc) -> LogFetcher<MockRpc> {
        LogFetcher::new(Arc::new(mock), GRID, STRATEGY)
    }

    #[test]
    fn test_is_range_too_wide() {
        let cases = [
            ("Limit Exceeded", true),
            ("query returned more than 10000 results", true),
            ("too many results", true),
            ("Block range too large", true),
            ("exceed maximum block range", true),
            ("response size is too large", true),
            ("log response size exceeded", true),
            ("connection refused", false),
            ("execution reverted", false),
            ("", false),
        ];
        for (message, want) in cases {
            assert_eq!(is_range_too_wide(message), want, "message: {message}");
        }
    }

    #[tokio::test]
    async fn test_fetch_adaptive_no_split() {
        let mock = MockRpc {
            filter_logs: Some(Box::new(|from, to, addresses| {
                assert_eq!((from, to), (10, 12));
                assert_eq!(addresses, vec![GRID, STRATEGY]);
                Ok(vec![test_log(10, 1, 2), test_log(10, 1, 3)])
            })),
            ..Default::default()
        };

        let logs = fetcher(mock).fetch_adaptive(10, 12).await.unwrap();
        assert_eq!(logs.len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_adaptive_splits_on_limit_exceeded() {
        // [1,10] fails once, both halves succeed: exactly three calls.
        let calls: Arc<Mutex<HashMap<(u64, u64), u32>>> = Arc::new(Mutex::new(HashMap::new()));
        let calls_clone = calls.clone();

        let mock = MockRpc {
            filter_logs: Some(Box::new(move |from, to, _| {
                *calls_clone.lock().unwrap().entry((from, to)).or_insert(0) += 1;
                match (from, to) {
                    (1, 10) => Err(IndexerError::Rpc(
                        "query returned more than 10000 results".into(),
                    )),
                    (1, 5) => Ok(vec![test_log(2, 0, 0)]),
                    (6, 10) => Ok(vec![test_log(9, 1, 1)]),
                    other => panic!("unexpected query range {other:?}"),
                }
            })),
            ..Default::default()
        };

        let logs = fetcher(mock).fetch_adaptive(1, 10).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(
            logs[0].block_number.unwrap().as_u64(),
            2,
            "halves concatenated in order"
        );

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[&(1, 10)], 1);
        assert_eq!(calls[&(1, 5)], 1);
        assert_eq!(calls[&(6, 10)], 1);
    }

    #[tokio::test]
    async fn test_fetch_adaptive_propagates_other_errors() {
        let mock = MockRpc {
            filter_logs: Some(Box::new(|_, _, _| {
                Err(IndexerError::Rpc("connection refused".into()))
            })),
            ..Default::default()
        };

        let err = fetcher(mock).fetch_adaptive(1, 10).await.unwrap_err();
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_single_block_falls_back_to_per_address_and_sorts() {
        let mock = MockRpc {
            filter_logs: Some(Box::new(|from, to, addresses| {
                assert_eq!((from, to), (7, 7));
                match addresses.as_slice() {
                    // Combined query triggers the fallback.
                    [_, _] => Err(IndexerError::Rpc("limit exceeded".into())),
                    [addr] if *addr == GRID => {
                        // Intentionally out of order.
                        Ok(vec![test_log(7, 0, 3), test_log(7, 0, 1)])
                    }
                    [addr] if *addr == STRATEGY => Ok(vec![test_log(7, 0, 2)]),
                    other => panic!("unexpected addresses {other:?}"),
                }
            })),
            ..Default::default()
        };

        let logs = fetcher(mock).fetch_adaptive(7, 7).await.unwrap();
        let indices: Vec<u64> = logs
            .iter()
            .map(|l| l.log_index.unwrap().as_u64())
            .collect();
        assert_eq!(indices, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_per_address_limit_falls_back_to_receipts() {
        let other: Address = Address::repeat_byte(0xff);
        let block_num = 42u64;

        let tx1 = H256::repeat_byte(0xa1);
        let tx2 = H256::repeat_byte(0xa2);

        let mut receipts: HashMap<TxHash, TransactionReceipt> = HashMap::new();
        receipts.insert(
            tx1,
            TransactionReceipt {
                logs: vec![
                    Log {
                        address: other,
                        ..test_log(block_num, 0, 0)
                    },
                    Log {
                        address: GRID,
                        ..test_log(block_num, 0, 2)
                    },
                ],
                ..Default::default()
            },
        );
        receipts.insert(
            tx2,
            TransactionReceipt {
                logs: vec![Log {
                    address: STRATEGY,
                    ..test_log(block_num, 1, 1)
                }],
                ..Default::default()
            },
        );

        let mock = MockRpc {
            filter_logs: Some(Box::new(move |from, to, addresses| {
                assert_eq!((from, to), (block_num, block_num));
                assert_eq!(addresses.len(), 1, "only per-address queries expected");
                Err(IndexerError::Rpc("log response size exceeded".into()))
            })),
            block_by_number: Some(Box::new(move |number| {
                assert_eq!(number, block_num);
                Ok(Some(Block {
                    transactions: vec![tx1, tx2],
                    ..Default::default()
                }))
            })),
            transaction_receipt: Some(Box::new(move |hash| Ok(receipts.get(&hash).cloned()))),
        };

        let logs = fetcher(mock)
            .fetch_single_block_per_address(block_num)
            .await
            .unwrap();

        // Only grid + strategy logs survive, sorted by (tx_index, log_index).
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].address, GRID);
        assert_eq!(logs[0].log_index.unwrap().as_u64(), 2);
        assert_eq!(logs[1].address, STRATEGY);
        assert_eq!(logs[1].log_index.unwrap().as_u64(), 1);
    }

    #[test]
    fn test_sort_logs_orders_by_block_tx_and_index() {
        let mut logs = vec![
            test_log(9, 0, 0),
            test_log(7, 2, 1),
            test_log(7, 0, 5),
            test_log(7, 0, 2),
            test_log(8, 1, 0),
        ];
        sort_logs(&mut logs);

        let keys: Vec<(u64, u64, u64)> = logs
            .iter()
            .map(|l| {
                (
                    l.block_number.unwrap().as_u64(),
                    l.transaction_index.unwrap().as_u64(),
                    l.log_index.unwrap().as_u64(),
                )
            })
            .collect();
        assert_eq!(
            keys,
            vec![(7, 0, 2), (7, 0, 5), (7, 2, 1), (8, 1, 0), (9, 0, 0)]
        );
    }
}
