// Copyright (c) GridEx, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-event-kind processing. Each handler decodes, performs any on-chain
//! reads it needs, persists through the batch transaction and returns the
//! Kafka messages to publish with the batch.

use chrono::{DateTime, Utc};
use diesel_async::AsyncPgConnection;
use ethers::types::{Address, Log, U256};
use num_bigint::BigInt;
use num_traits::Zero;
use tracing::{info, warn};

use crate::abi::{
    split_grid_order_id, to_grid_order_id, CancelGridOrderEvent, CancelWholeGridEvent,
    FilledOrderEvent, GridExEvent, GridFeeChangedEvent, GridOrderCreatedEvent,
    LinearStrategyCreatedEvent, PairCreatedEvent, WithdrawProfitEvent,
};
use crate::amounts::{calc_initial_amounts, calc_quote_amount, i256_to_bigint, order_price, u256_to_bigint};
use crate::db::models::{NewGrid, NewOrder, NewOrderFill, NewPair};
use crate::db::repository;
use crate::error::{IndexerError, IndexerResult};
use crate::kafka::{
    EventData, EventType, GridCancelledData, GridCreatedData, GridFeeChangedData, Message,
    OrderCancelledData, OrderCreatedData, OrderFilledData, PairCreatedData, ProfitWithdrawnData,
};
use crate::rpc::ChainRpc;
use crate::scanner::{Scanner, StrategyInfo};

/// Full lowercase `0x`-prefixed hex of an address.
fn addr_hex(addr: Address) -> String {
    format!("{addr:?}")
}

/// Grid ids are uint128 on chain but grid rows store them as BIGINT; a value
/// above 2^63-1 wraps. Every store-side narrowing goes through here.
fn grid_id_i64(grid_id: u128) -> i64 {
    grid_id as i64
}

fn log_block(log: &Log) -> u64 {
    log.block_number.unwrap_or_default().as_u64()
}

fn log_tx_hash(log: &Log) -> String {
    format!("{:?}", log.transaction_hash.unwrap_or_default())
}

fn log_index(log: &Log) -> u64 {
    log.log_index.unwrap_or_default().as_u64()
}

impl<C: ChainRpc> Scanner<C> {
    pub(crate) async fn process_log(
        &mut self,
        conn: &mut AsyncPgConnection,
        log: &Log,
    ) -> IndexerResult<Vec<Message>> {
        let Some(event) = GridExEvent::try_from_log(log)? else {
            return Ok(vec![]);
        };

        match event {
            GridExEvent::LinearStrategyCreated(ev) => self.handle_linear_strategy_created(ev),
            GridExEvent::PairCreated(ev) => self.handle_pair_created(conn, log, ev).await,
            GridExEvent::GridOrderCreated(ev) => {
                self.handle_grid_order_created(conn, log, ev).await
            }
            GridExEvent::FilledOrder(ev) => self.handle_filled_order(conn, log, ev).await,
            GridExEvent::CancelGridOrder(ev) => self.handle_cancel_grid_order(conn, log, ev).await,
            GridExEvent::CancelWholeGrid(ev) => self.handle_cancel_whole_grid(conn, log, ev).await,
            GridExEvent::GridFeeChanged(ev) => self.handle_grid_fee_changed(conn, log, ev).await,
            GridExEvent::WithdrawProfit(ev) => self.handle_withdraw_profit(conn, log, ev).await,
        }
    }

    fn make_base_msg(&self, log: &Log, event_type: EventType, data: EventData) -> Message {
        Message {
            event_type,
            chain_id: self.chain_id,
            block_number: log_block(log),
            tx_hash: log_tx_hash(log),
            log_index: log_index(log),
            timestamp: Utc::now().timestamp(),
            data,
        }
    }

    /// Cache the strategy parameters keyed by grid id. The matching
    /// GridOrderCreated in the same transaction consumes them; no message is
    /// emitted here.
    fn handle_linear_strategy_created(
        &mut self,
        event: LinearStrategyCreatedEvent,
    ) -> IndexerResult<Vec<Message>> {
        let grid_id = event.grid_id.to_string();

        info!(
            grid_id = %grid_id,
            is_ask = event.is_ask,
            price0 = %event.price0,
            gap = %event.gap,
            "LinearStrategyCreated"
        );

        let info = self.strategy_cache.entry(grid_id).or_default();
        if event.is_ask {
            info.ask_price0 = Some(u256_to_bigint(event.price0));
            info.ask_gap = Some(i256_to_bigint(event.gap));
        } else {
            info.bid_price0 = Some(u256_to_bigint(event.price0));
            info.bid_gap = Some(i256_to_bigint(event.gap));
        }

        Ok(vec![])
    }

    async fn handle_pair_created(
        &mut self,
        conn: &mut AsyncPgConnection,
        log: &Log,
        event: PairCreatedEvent,
    ) -> IndexerResult<Vec<Message>> {
        info!(
            pair_id = event.pair_id,
            base = ?event.base,
            quote = ?event.quote,
            "PairCreated"
        );

        let block_number = log_block(log);
        let base_info = self.get_or_fetch_token(conn, event.base, block_number).await?;
        let quote_info = self
            .get_or_fetch_token(conn, event.quote, block_number)
            .await?;

        repository::insert_pair(
            conn,
            &NewPair {
                chain_id: self.chain_id,
                pair_id: event.pair_id as i32,
                base_token: base_info.symbol.clone(),
                base_token_address: addr_hex(event.base),
                quote_token: quote_info.symbol.clone(),
                quote_token_address: addr_hex(event.quote),
                create_block: block_number as i64,
                update_block: block_number as i64,
            },
        )
        .await?;

        let msg = self.make_base_msg(
            log,
            EventType::PairCreated,
            EventData::PairCreated(PairCreatedData {
                pair_id: event.pair_id as i32,
                base_address: addr_hex(event.base),
                quote_address: addr_hex(event.quote),
                base_symbol: base_info.symbol,
                quote_symbol: quote_info.symbol,
            }),
        );

        Ok(vec![msg])
    }

    async fn handle_grid_order_created(
        &mut self,
        conn: &mut AsyncPgConnection,
        log: &Log,
        event: GridOrderCreatedEvent,
    ) -> IndexerResult<Vec<Message>> {
        let grid_id = grid_id_i64(event.grid_id);
        let grid_key = event.grid_id.to_string();

        // The LinearStrategyCreated events fire before GridOrderCreated in
        // the same transaction; their absence means malformed input or a
        // missed event, and the whole batch must be retried.
        let strat = self
            .strategy_cache
            .remove(&grid_key)
            .ok_or_else(|| IndexerError::MissingStrategy(grid_key.clone()))?;

        let ask_price0_str = strat.ask_price0.as_ref().map(ToString::to_string).unwrap_or_default();
        let ask_gap_str = strat.ask_gap.as_ref().map(ToString::to_string).unwrap_or_default();
        let bid_price0_str = strat.bid_price0.as_ref().map(ToString::to_string).unwrap_or_default();
        let bid_gap_str = strat.bid_gap.as_ref().map(ToString::to_string).unwrap_or_default();

        info!(
            grid_id,
            ask_price0 = %ask_price0_str,
            ask_gap = %ask_gap_str,
            bid_price0 = %bid_price0_str,
            bid_gap = %bid_gap_str,
            "consumed cached strategy parameters"
        );

        let block_number = log_block(log);

        // Resolve the pair's tokens from chain to label the grid.
        let (base_addr, quote_addr) = self.caller.get_pair_tokens(event.pair_id).await?;
        let base_info = self.get_or_fetch_token(conn, base_addr, block_number).await?;
        let quote_info = self.get_or_fetch_token(conn, quote_addr, block_number).await?;

        let base_amt = u256_to_bigint(event.amount);
        let bid_price0 = strat.bid_price0.clone().unwrap_or_else(BigInt::zero);
        let bid_gap = strat.bid_gap.clone().unwrap_or_else(BigInt::zero);
        let (initial_base, initial_quote) =
            calc_initial_amounts(&base_amt, &bid_price0, &bid_gap, event.asks, event.bids);
        let initial_base_str = initial_base.to_string();
        let initial_quote_str = initial_quote.to_string();

        info!(
            grid_id,
            owner = ?event.owner,
            pair_id = event.pair_id,
            asks = event.asks,
            bids = event.bids,
            initial_base_amount = %initial_base_str,
            initial_quote_amount = %initial_quote_str,
            "GridOrderCreated"
        );

        repository::insert_grid(
            conn,
            &NewGrid {
                chain_id: self.chain_id,
                grid_id,
                owner: addr_hex(event.owner),
                pair_id: event.pair_id as i32,
                base_token: base_info.symbol.clone(),
                quote_token: quote_info.symbol.clone(),
                ask_order_count: event.asks as i32,
                bid_order_count: event.bids as i32,
                initial_base_amount: initial_base_str.clone(),
                initial_quote_amount: initial_quote_str.clone(),
                fee: event.fee as i32,
                compound: event.compound,
                oneshot: event.oneshot,
                status: 1,
                ask_price0: ask_price0_str.clone(),
                ask_gap: ask_gap_str.clone(),
                bid_price0: bid_price0_str.clone(),
                bid_gap: bid_gap_str.clone(),
                profits: "0".to_string(),
                create_block: block_number as i64,
                update_block: block_number as i64,
            },
        )
        .await?;

        repository::increment_pair_active_grids(
            conn,
            self.chain_id,
            event.pair_id as i32,
            block_number,
        )
        .await?;

        let mut messages = Vec::with_capacity(1 + (event.asks + event.bids) as usize);
        messages.push(self.make_base_msg(
            log,
            EventType::GridCreated,
            EventData::GridCreated(GridCreatedData {
                grid_id,
                owner: addr_hex(event.owner),
                pair_id: event.pair_id as i32,
                base_token: base_info.symbol,
                quote_token: quote_info.symbol,
                ask_order_count: event.asks as i32,
                bid_order_count: event.bids as i32,
                initial_base_amount: initial_base_str.clone(),
                initial_quote_amount: initial_quote_str.clone(),
                fee: event.fee as i32,
                compound: event.compound,
                oneshot: event.oneshot,
                ask_price0: ask_price0_str,
                ask_gap: ask_gap_str,
                bid_price0: bid_price0_str,
                bid_gap: bid_gap_str,
            }),
        ));

        // Synthesize every order from the strategy parameters; no further
        // RPC calls are needed.
        for i in 0..event.asks {
            let order_id = event.ask_order_id + U256::from(i);
            let msg = self
                .compute_and_insert_order(
                    conn, log, &event, &strat, &base_amt, order_id, true, i,
                    &initial_base_str, &initial_quote_str,
                )
                .await?;
            messages.push(msg);
        }
        for i in 0..event.bids {
            let order_id = event.bid_order_id + U256::from(i);
            let msg = self
                .compute_and_insert_order(
                    conn, log, &event, &strat, &base_amt, order_id, false, i,
                    &initial_base_str, &initial_quote_str,
                )
                .await?;
            messages.push(msg);
        }

        Ok(messages)
    }

    /// Derive one order from the strategy parameters and persist it.
    ///
    /// Ask order i: price = ask_price0 + ask_gap * i, amount = base_amt.
    /// Bid order i: price = bid_price0 + bid_gap * i,
    ///              amount = floor(base_amt * price / 10^36).
    /// rev_price is one gap toward the opposite side; rev_amount starts at 0.
    #[allow(clippy::too_many_arguments)]
    async fn compute_and_insert_order(
        &mut self,
        conn: &mut AsyncPgConnection,
        log: &Log,
        event: &GridOrderCreatedEvent,
        strat: &StrategyInfo,
        base_amt: &BigInt,
        order_id: U256,
        is_ask: bool,
        order_index: u32,
        initial_base_amount: &str,
        initial_quote_amount: &str,
    ) -> IndexerResult<Message> {
        let zero = BigInt::zero();
        let (price, rev_price, amount) = if is_ask {
            let price0 = strat.ask_price0.as_ref().unwrap_or(&zero);
            let gap = strat.ask_gap.as_ref().unwrap_or(&zero);
            let price = order_price(price0, gap, order_index);
            let rev_price = &price - gap;
            (price, rev_price, base_amt.clone())
        } else {
            let price0 = strat.bid_price0.as_ref().unwrap_or(&zero);
            let gap = strat.bid_gap.as_ref().unwrap_or(&zero);
            let price = order_price(price0, gap, order_index);
            let rev_price = &price + gap;
            let amount = calc_quote_amount(base_amt, &price);
            (price, rev_price, amount)
        };

        let grid_order_id = to_grid_order_id(event.grid_id, order_id).to_string();
        let block_number = log_block(log);

        repository::insert_order(
            conn,
            &NewOrder {
                chain_id: self.chain_id,
                order_id: grid_order_id.clone(),
                grid_id: grid_id_i64(event.grid_id),
                pair_id: event.pair_id as i32,
                is_ask,
                compound: event.compound,
                oneshot: event.oneshot,
                fee: event.fee as i32,
                status: 0,
                amount: amount.to_string(),
                rev_amount: "0".to_string(),
                initial_base_amount: initial_base_amount.to_string(),
                initial_quote_amount: initial_quote_amount.to_string(),
                price: price.to_string(),
                rev_price: rev_price.to_string(),
                create_block: block_number as i64,
                update_block: block_number as i64,
            },
        )
        .await?;

        Ok(self.make_base_msg(
            log,
            EventType::OrderCreated,
            EventData::OrderCreated(OrderCreatedData {
                order_id: grid_order_id,
                grid_id: grid_id_i64(event.grid_id),
                pair_id: event.pair_id as i32,
                is_ask,
                amount: amount.to_string(),
                rev_amount: "0".to_string(),
                price: price.to_string(),
                rev_price: rev_price.to_string(),
                initial_base_amount: initial_base_amount.to_string(),
                initial_quote_amount: initial_quote_amount.to_string(),
            }),
        ))
    }

    async fn handle_filled_order(
        &mut self,
        conn: &mut AsyncPgConnection,
        log: &Log,
        event: FilledOrderEvent,
    ) -> IndexerResult<Vec<Message>> {
        let (grid_id, _) = split_grid_order_id(event.grid_order_id);
        let order_id = event.grid_order_id.to_string();

        info!(
            grid_order_id = %order_id,
            grid_id,
            taker = ?event.taker,
            is_ask = event.is_ask,
            "FilledOrder"
        );

        let block_number = log_block(log);
        let timestamp = self.block_timestamp(block_number).await;

        let pair_id = repository::order_pair_id(conn, self.chain_id, &order_id)
            .await?
            .unwrap_or_else(|| {
                warn!(order_id = %order_id, "fill references unknown order, pair_id defaulted");
                0
            });

        repository::insert_order_fill(
            conn,
            &NewOrderFill {
                chain_id: self.chain_id,
                tx_hash: log_tx_hash(log),
                order_id: order_id.clone(),
                log_index: log_index(log) as i64,
                taker: addr_hex(event.taker),
                pair_id,
                filled_amount: event.base_amt.to_string(),
                filled_volume: event.quote_vol.to_string(),
                is_ask: event.is_ask,
                timestamp,
                create_block: block_number as i64,
            },
        )
        .await?;

        repository::update_order_on_fill(
            conn,
            self.chain_id,
            &order_id,
            &event.order_amt.to_string(),
            &event.order_rev_amt.to_string(),
            block_number,
        )
        .await?;

        let msg = self.make_base_msg(
            log,
            EventType::OrderFilled,
            EventData::OrderFilled(OrderFilledData {
                order_id,
                grid_id: grid_id_i64(grid_id),
                taker: addr_hex(event.taker),
                base_amt: event.base_amt.to_string(),
                quote_vol: event.quote_vol.to_string(),
                order_amt: event.order_amt.to_string(),
                order_rev_amt: event.order_rev_amt.to_string(),
                is_ask: event.is_ask,
            }),
        );

        Ok(vec![msg])
    }

    /// Block timestamp, best effort: wall clock with a warning when the
    /// block fetch fails.
    async fn block_timestamp(&self, block_number: u64) -> chrono::NaiveDateTime {
        match self.client.block_by_number(block_number).await {
            Ok(Some(block)) => {
                let secs = block.timestamp.as_u64() as i64;
                DateTime::<Utc>::from_timestamp(secs, 0)
                    .map(|dt| dt.naive_utc())
                    .unwrap_or_else(|| Utc::now().naive_utc())
            }
            Ok(None) => {
                warn!(block_number, "block not found, using current time");
                Utc::now().naive_utc()
            }
            Err(e) => {
                warn!(block_number, error = %e, "failed to get block timestamp, using current time");
                Utc::now().naive_utc()
            }
        }
    }

    async fn handle_cancel_grid_order(
        &mut self,
        conn: &mut AsyncPgConnection,
        log: &Log,
        event: CancelGridOrderEvent,
    ) -> IndexerResult<Vec<Message>> {
        info!(
            owner = ?event.owner,
            order_id = event.order_id,
            grid_id = event.grid_id,
            "CancelGridOrder"
        );

        let grid_order_id = to_grid_order_id(event.grid_id, U256::from(event.order_id)).to_string();
        repository::cancel_order(conn, self.chain_id, &grid_order_id, log_block(log)).await?;

        let msg = self.make_base_msg(
            log,
            EventType::OrderCancelled,
            EventData::OrderCancelled(OrderCancelledData {
                order_id: grid_order_id,
                grid_id: grid_id_i64(event.grid_id),
                owner: addr_hex(event.owner),
            }),
        );

        Ok(vec![msg])
    }

    async fn handle_cancel_whole_grid(
        &mut self,
        conn: &mut AsyncPgConnection,
        log: &Log,
        event: CancelWholeGridEvent,
    ) -> IndexerResult<Vec<Message>> {
        let grid_id = grid_id_i64(event.grid_id);
        let block_number = log_block(log);

        info!(owner = ?event.owner, grid_id, "CancelWholeGrid");

        // Look the pair up before cancelling so active_grids can be
        // decremented; a missing grid only skips the decrement.
        match repository::grid_pair_id(conn, self.chain_id, grid_id).await? {
            Some(pair_id) => {
                repository::decrement_pair_active_grids(conn, self.chain_id, pair_id, block_number)
                    .await?;
            }
            None => warn!(grid_id, "grid not found, skipping active_grids decrement"),
        }

        repository::cancel_grid(conn, self.chain_id, grid_id, block_number).await?;

        let msg = self.make_base_msg(
            log,
            EventType::GridCancelled,
            EventData::GridCancelled(GridCancelledData {
                grid_id,
                owner: addr_hex(event.owner),
            }),
        );

        Ok(vec![msg])
    }

    async fn handle_grid_fee_changed(
        &mut self,
        conn: &mut AsyncPgConnection,
        log: &Log,
        event: GridFeeChangedEvent,
    ) -> IndexerResult<Vec<Message>> {
        // GridFeeChanged carries the id as uint256; take its low 128 bits.
        let grid_id = grid_id_i64(event.grid_id.low_u128());

        info!(grid_id, fee = event.fee, "GridFeeChanged");

        repository::update_grid_fee(conn, self.chain_id, grid_id, event.fee as i32, log_block(log))
            .await?;

        let msg = self.make_base_msg(
            log,
            EventType::GridFeeChanged,
            EventData::GridFeeChanged(GridFeeChangedData {
                grid_id,
                fee: event.fee as i32,
            }),
        );

        Ok(vec![msg])
    }

    async fn handle_withdraw_profit(
        &mut self,
        conn: &mut AsyncPgConnection,
        log: &Log,
        event: WithdrawProfitEvent,
    ) -> IndexerResult<Vec<Message>> {
        let grid_id = grid_id_i64(event.grid_id);

        info!(
            grid_id,
            quote = ?event.quote,
            to = ?event.to,
            amt = %event.amt,
            "WithdrawProfit"
        );

        repository::add_grid_profits(
            conn,
            self.chain_id,
            grid_id,
            &event.amt.to_string(),
            log_block(log),
        )
        .await?;

        let msg = self.make_base_msg(
            log,
            EventType::ProfitWithdrawn,
            EventData::ProfitWithdrawn(ProfitWithdrawnData {
                grid_id,
                quote: addr_hex(event.quote),
                to: addr_hex(event.to),
                amount: event.amt.to_string(),
            }),
        );

        Ok(vec![msg])
    }
}
