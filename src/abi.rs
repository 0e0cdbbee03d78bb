// Copyright (c) GridEx, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Event codec for the GridEx exchange and Linear strategy contracts.
//!
//! Decoding is dispatched on the log's first topic. Logs whose topic is not
//! one of the known signatures are ignored; a known topic whose payload fails
//! to decode is an error (the batch is retried).

use ethers::abi::{Abi, RawLog, Token};
use ethers::types::{Address, Log, H256, I256, U256};
use once_cell::sync::Lazy;

use crate::error::{IndexerError, IndexerResult};

/// Minimal ABI carrying only the GridEx exchange events.
const GRIDEX_ABI_JSON: &str = r#"[
  {
    "anonymous": false,
    "inputs": [
      {"indexed": true, "name": "base", "type": "address"},
      {"indexed": true, "name": "quote", "type": "address"},
      {"indexed": false, "name": "pairId", "type": "uint64"}
    ],
    "name": "PairCreated",
    "type": "event"
  },
  {
    "anonymous": false,
    "inputs": [
      {"indexed": true, "name": "owner", "type": "address"},
      {"indexed": false, "name": "pairId", "type": "uint64"},
      {"indexed": false, "name": "amount", "type": "uint256"},
      {"indexed": false, "name": "gridId", "type": "uint128"},
      {"indexed": false, "name": "askOrderId", "type": "uint256"},
      {"indexed": false, "name": "bidOrderId", "type": "uint256"},
      {"indexed": false, "name": "asks", "type": "uint32"},
      {"indexed": false, "name": "bids", "type": "uint32"},
      {"indexed": false, "name": "fee", "type": "uint32"},
      {"indexed": false, "name": "compound", "type": "bool"},
      {"indexed": false, "name": "oneshot", "type": "bool"}
    ],
    "name": "GridOrderCreated",
    "type": "event"
  },
  {
    "anonymous": false,
    "inputs": [
      {"indexed": false, "name": "taker", "type": "address"},
      {"indexed": false, "name": "gridOrderId", "type": "uint256"},
      {"indexed": false, "name": "baseAmt", "type": "uint256"},
      {"indexed": false, "name": "quoteVol", "type": "uint256"},
      {"indexed": false, "name": "orderAmt", "type": "uint256"},
      {"indexed": false, "name": "orderRevAmt", "type": "uint256"},
      {"indexed": false, "name": "isAsk", "type": "bool"}
    ],
    "name": "FilledOrder",
    "type": "event"
  },
  {
    "anonymous": false,
    "inputs": [
      {"indexed": true, "name": "owner", "type": "address"},
      {"indexed": true, "name": "orderId", "type": "uint128"},
      {"indexed": true, "name": "gridId", "type": "uint128"}
    ],
    "name": "CancelGridOrder",
    "type": "event"
  },
  {
    "anonymous": false,
    "inputs": [
      {"indexed": true, "name": "owner", "type": "address"},
      {"indexed": true, "name": "gridId", "type": "uint128"}
    ],
    "name": "CancelWholeGrid",
    "type": "event"
  },
  {
    "anonymous": false,
    "inputs": [
      {"indexed": true, "name": "sender", "type": "address"},
      {"indexed": false, "name": "gridId", "type": "uint256"},
      {"indexed": false, "name": "fee", "type": "uint32"}
    ],
    "name": "GridFeeChanged",
    "type": "event"
  },
  {
    "anonymous": false,
    "inputs": [
      {"indexed": false, "name": "gridId", "type": "uint128"},
      {"indexed": false, "name": "quote", "type": "address"},
      {"indexed": false, "name": "to", "type": "address"},
      {"indexed": false, "name": "amt", "type": "uint256"}
    ],
    "name": "WithdrawProfit",
    "type": "event"
  }
]"#;

/// Minimal ABI for the Linear strategy contract.
const STRATEGY_ABI_JSON: &str = r#"[
  {
    "anonymous": false,
    "inputs": [
      {"indexed": false, "name": "isAsk", "type": "bool"},
      {"indexed": false, "name": "gridId", "type": "uint128"},
      {"indexed": false, "name": "price0", "type": "uint256"},
      {"indexed": false, "name": "gap", "type": "int256"}
    ],
    "name": "LinearStrategyCreated",
    "type": "event"
  }
]"#;

static GRIDEX_ABI: Lazy<Abi> =
    Lazy::new(|| serde_json::from_str(GRIDEX_ABI_JSON).expect("valid gridex abi"));

static STRATEGY_ABI: Lazy<Abi> =
    Lazy::new(|| serde_json::from_str(STRATEGY_ABI_JSON).expect("valid strategy abi"));

fn event_topic(abi: &Abi, name: &str) -> H256 {
    abi.event(name).expect("known event").signature()
}

pub static TOPIC_PAIR_CREATED: Lazy<H256> = Lazy::new(|| event_topic(&GRIDEX_ABI, "PairCreated"));
pub static TOPIC_GRID_ORDER_CREATED: Lazy<H256> =
    Lazy::new(|| event_topic(&GRIDEX_ABI, "GridOrderCreated"));
pub static TOPIC_FILLED_ORDER: Lazy<H256> = Lazy::new(|| event_topic(&GRIDEX_ABI, "FilledOrder"));
pub static TOPIC_CANCEL_GRID_ORDER: Lazy<H256> =
    Lazy::new(|| event_topic(&GRIDEX_ABI, "CancelGridOrder"));
pub static TOPIC_CANCEL_WHOLE_GRID: Lazy<H256> =
    Lazy::new(|| event_topic(&GRIDEX_ABI, "CancelWholeGrid"));
pub static TOPIC_GRID_FEE_CHANGED: Lazy<H256> =
    Lazy::new(|| event_topic(&GRIDEX_ABI, "GridFeeChanged"));
pub static TOPIC_WITHDRAW_PROFIT: Lazy<H256> =
    Lazy::new(|| event_topic(&GRIDEX_ABI, "WithdrawProfit"));
pub static TOPIC_LINEAR_STRATEGY_CREATED: Lazy<H256> =
    Lazy::new(|| event_topic(&STRATEGY_ABI, "LinearStrategyCreated"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairCreatedEvent {
    pub base: Address,
    pub quote: Address,
    pub pair_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridOrderCreatedEvent {
    pub owner: Address,
    pub pair_id: u64,
    pub amount: U256,
    pub grid_id: u128,
    /// First ask order id
    pub ask_order_id: U256,
    /// First bid order id
    pub bid_order_id: U256,
    pub asks: u32,
    pub bids: u32,
    pub fee: u32,
    pub compound: bool,
    pub oneshot: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilledOrderEvent {
    pub taker: Address,
    /// `(grid_id << 128) | order_id`
    pub grid_order_id: U256,
    pub base_amt: U256,
    pub quote_vol: U256,
    pub order_amt: U256,
    pub order_rev_amt: U256,
    pub is_ask: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelGridOrderEvent {
    pub owner: Address,
    pub order_id: u128,
    pub grid_id: u128,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelWholeGridEvent {
    pub owner: Address,
    pub grid_id: u128,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridFeeChangedEvent {
    pub sender: Address,
    pub grid_id: U256,
    pub fee: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawProfitEvent {
    pub grid_id: u128,
    pub quote: Address,
    pub to: Address,
    pub amt: U256,
}

/// Emitted by the Linear strategy contract before GridOrderCreated in the
/// same transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearStrategyCreatedEvent {
    pub is_ask: bool,
    pub grid_id: u128,
    pub price0: U256,
    /// Price gap between consecutive orders; negative on the bid side.
    pub gap: I256,
}

/// A decoded GridEx event of any kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GridExEvent {
    PairCreated(PairCreatedEvent),
    GridOrderCreated(GridOrderCreatedEvent),
    FilledOrder(FilledOrderEvent),
    CancelGridOrder(CancelGridOrderEvent),
    CancelWholeGrid(CancelWholeGridEvent),
    GridFeeChanged(GridFeeChangedEvent),
    WithdrawProfit(WithdrawProfitEvent),
    LinearStrategyCreated(LinearStrategyCreatedEvent),
}

impl GridExEvent {
    /// Decode a raw log. Returns `Ok(None)` for unknown topics.
    pub fn try_from_log(log: &Log) -> IndexerResult<Option<Self>> {
        let Some(topic0) = log.topics.first() else {
            return Ok(None);
        };

        let event = if *topic0 == *TOPIC_PAIR_CREATED {
            GridExEvent::PairCreated(decode_pair_created(log)?)
        } else if *topic0 == *TOPIC_GRID_ORDER_CREATED {
            GridExEvent::GridOrderCreated(decode_grid_order_created(log)?)
        } else if *topic0 == *TOPIC_FILLED_ORDER {
            GridExEvent::FilledOrder(decode_filled_order(log)?)
        } else if *topic0 == *TOPIC_CANCEL_GRID_ORDER {
            GridExEvent::CancelGridOrder(decode_cancel_grid_order(log)?)
        } else if *topic0 == *TOPIC_CANCEL_WHOLE_GRID {
            GridExEvent::CancelWholeGrid(decode_cancel_whole_grid(log)?)
        } else if *topic0 == *TOPIC_GRID_FEE_CHANGED {
            GridExEvent::GridFeeChanged(decode_grid_fee_changed(log)?)
        } else if *topic0 == *TOPIC_WITHDRAW_PROFIT {
            GridExEvent::WithdrawProfit(decode_withdraw_profit(log)?)
        } else if *topic0 == *TOPIC_LINEAR_STRATEGY_CREATED {
            GridExEvent::LinearStrategyCreated(decode_linear_strategy_created(log)?)
        } else {
            return Ok(None);
        };

        Ok(Some(event))
    }
}

/// Parse a log against a named ABI event, yielding tokens in declaration
/// order (indexed parameters are recovered from the topics).
fn parse_event(abi: &Abi, name: &str, log: &Log) -> IndexerResult<std::vec::IntoIter<Token>> {
    let event = abi
        .event(name)
        .map_err(|e| IndexerError::Decode(format!("{name}: {e}")))?;
    let raw = RawLog {
        topics: log.topics.clone(),
        data: log.data.to_vec(),
    };
    let parsed = event
        .parse_log(raw)
        .map_err(|e| IndexerError::Decode(format!("{name}: {e}")))?;
    Ok(parsed
        .params
        .into_iter()
        .map(|p| p.value)
        .collect::<Vec<_>>()
        .into_iter())
}

fn next_token(it: &mut std::vec::IntoIter<Token>, event: &str) -> IndexerResult<Token> {
    it.next()
        .ok_or_else(|| IndexerError::Decode(format!("{event}: missing parameter")))
}

fn as_address(token: Token, event: &str) -> IndexerResult<Address> {
    token
        .into_address()
        .ok_or_else(|| IndexerError::Decode(format!("{event}: expected address")))
}

fn as_uint(token: Token, event: &str) -> IndexerResult<U256> {
    token
        .into_uint()
        .ok_or_else(|| IndexerError::Decode(format!("{event}: expected uint")))
}

fn as_int(token: Token, event: &str) -> IndexerResult<I256> {
    token
        .into_int()
        .map(I256::from_raw)
        .ok_or_else(|| IndexerError::Decode(format!("{event}: expected int")))
}

fn as_bool(token: Token, event: &str) -> IndexerResult<bool> {
    token
        .into_bool()
        .ok_or_else(|| IndexerError::Decode(format!("{event}: expected bool")))
}

fn decode_pair_created(log: &Log) -> IndexerResult<PairCreatedEvent> {
    const EV: &str = "PairCreated";
    let mut it = parse_event(&GRIDEX_ABI, EV, log)?;
    Ok(PairCreatedEvent {
        base: as_address(next_token(&mut it, EV)?, EV)?,
        quote: as_address(next_token(&mut it, EV)?, EV)?,
        pair_id: as_uint(next_token(&mut it, EV)?, EV)?.as_u64(),
    })
}

fn decode_grid_order_created(log: &Log) -> IndexerResult<GridOrderCreatedEvent> {
    const EV: &str = "GridOrderCreated";
    let mut it = parse_event(&GRIDEX_ABI, EV, log)?;
    Ok(GridOrderCreatedEvent {
        owner: as_address(next_token(&mut it, EV)?, EV)?,
        pair_id: as_uint(next_token(&mut it, EV)?, EV)?.as_u64(),
        amount: as_uint(next_token(&mut it, EV)?, EV)?,
        grid_id: as_uint(next_token(&mut it, EV)?, EV)?.as_u128(),
        ask_order_id: as_uint(next_token(&mut it, EV)?, EV)?,
        bid_order_id: as_uint(next_token(&mut it, EV)?, EV)?,
        asks: as_uint(next_token(&mut it, EV)?, EV)?.as_u32(),
        bids: as_uint(next_token(&mut it, EV)?, EV)?.as_u32(),
        fee: as_uint(next_token(&mut it, EV)?, EV)?.as_u32(),
        compound: as_bool(next_token(&mut it, EV)?, EV)?,
        oneshot: as_bool(next_token(&mut it, EV)?, EV)?,
    })
}

fn decode_filled_order(log: &Log) -> IndexerResult<FilledOrderEvent> {
    const EV: &str = "FilledOrder";
    let mut it = parse_event(&GRIDEX_ABI, EV, log)?;
    Ok(FilledOrderEvent {
        taker: as_address(next_token(&mut it, EV)?, EV)?,
        grid_order_id: as_uint(next_token(&mut it, EV)?, EV)?,
        base_amt: as_uint(next_token(&mut it, EV)?, EV)?,
        quote_vol: as_uint(next_token(&mut it, EV)?, EV)?,
        order_amt: as_uint(next_token(&mut it, EV)?, EV)?,
        order_rev_amt: as_uint(next_token(&mut it, EV)?, EV)?,
        is_ask: as_bool(next_token(&mut it, EV)?, EV)?,
    })
}

fn decode_cancel_grid_order(log: &Log) -> IndexerResult<CancelGridOrderEvent> {
    const EV: &str = "CancelGridOrder";
    let mut it = parse_event(&GRIDEX_ABI, EV, log)?;
    Ok(CancelGridOrderEvent {
        owner: as_address(next_token(&mut it, EV)?, EV)?,
        order_id: as_uint(next_token(&mut it, EV)?, EV)?.as_u128(),
        grid_id: as_uint(next_token(&mut it, EV)?, EV)?.as_u128(),
    })
}

fn decode_cancel_whole_grid(log: &Log) -> IndexerResult<CancelWholeGridEvent> {
    const EV: &str = "CancelWholeGrid";
    let mut it = parse_event(&GRIDEX_ABI, EV, log)?;
    Ok(CancelWholeGridEvent {
        owner: as_address(next_token(&mut it, EV)?, EV)?,
        grid_id: as_uint(next_token(&mut it, EV)?, EV)?.as_u128(),
    })
}

fn decode_grid_fee_changed(log: &Log) -> IndexerResult<GridFeeChangedEvent> {
    const EV: &str = "GridFeeChanged";
    let mut it = parse_event(&GRIDEX_ABI, EV, log)?;
    Ok(GridFeeChangedEvent {
        sender: as_address(next_token(&mut it, EV)?, EV)?,
        grid_id: as_uint(next_token(&mut it, EV)?, EV)?,
        fee: as_uint(next_token(&mut it, EV)?, EV)?.as_u32(),
    })
}

fn decode_withdraw_profit(log: &Log) -> IndexerResult<WithdrawProfitEvent> {
    const EV: &str = "WithdrawProfit";
    let mut it = parse_event(&GRIDEX_ABI, EV, log)?;
    Ok(WithdrawProfitEvent {
        grid_id: as_uint(next_token(&mut it, EV)?, EV)?.as_u128(),
        quote: as_address(next_token(&mut it, EV)?, EV)?,
        to: as_address(next_token(&mut it, EV)?, EV)?,
        amt: as_uint(next_token(&mut it, EV)?, EV)?,
    })
}

fn decode_linear_strategy_created(log: &Log) -> IndexerResult<LinearStrategyCreatedEvent> {
    const EV: &str = "LinearStrategyCreated";
    let mut it = parse_event(&STRATEGY_ABI, EV, log)?;
    Ok(LinearStrategyCreatedEvent {
        is_ask: as_bool(next_token(&mut it, EV)?, EV)?,
        grid_id: as_uint(next_token(&mut it, EV)?, EV)?.as_u128(),
        price0: as_uint(next_token(&mut it, EV)?, EV)?,
        gap: as_int(next_token(&mut it, EV)?, EV)?,
    })
}

/// `grid_order_id = (grid_id << 128) | order_id`
pub fn to_grid_order_id(grid_id: u128, order_id: U256) -> U256 {
    (U256::from(grid_id) << 128) | order_id
}

/// Split a `grid_order_id` back into `(grid_id, order_id)`.
pub fn split_grid_order_id(grid_order_id: U256) -> (u128, U256) {
    let mask = (U256::one() << 128) - U256::one();
    ((grid_order_id >> 128).as_u128(), grid_order_id & mask)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ethers::abi::Token;
    use ethers::types::{Bytes, H256};

    pub(crate) fn topic_from_address(addr: Address) -> H256 {
        let mut bytes = [0u8; 32];
        bytes[12..].copy_from_slice(addr.as_bytes());
        H256::from(bytes)
    }

    pub(crate) fn topic_from_u128(value: u128) -> H256 {
        let mut bytes = [0u8; 32];
        U256::from(value).to_big_endian(&mut bytes);
        H256::from(bytes)
    }

    fn log_with(topics: Vec<H256>, data: Vec<Token>) -> Log {
        Log {
            topics,
            data: Bytes::from(ethers::abi::encode(&data)),
            ..Default::default()
        }
    }

    #[test]
    fn test_decode_pair_created() {
        let base: Address = "0x00000000000000000000000000000000000000Ab"
            .parse()
            .unwrap();
        let quote: Address = "0x00000000000000000000000000000000000000Cd"
            .parse()
            .unwrap();
        let log = log_with(
            vec![
                *TOPIC_PAIR_CREATED,
                topic_from_address(base),
                topic_from_address(quote),
            ],
            vec![Token::Uint(U256::from(7u64))],
        );

        let event = match GridExEvent::try_from_log(&log).unwrap().unwrap() {
            GridExEvent::PairCreated(e) => e,
            other => panic!("unexpected event: {other:?}"),
        };
        assert_eq!(event.base, base);
        assert_eq!(event.quote, quote);
        assert_eq!(event.pair_id, 7);
    }

    #[test]
    fn test_decode_grid_order_created() {
        let owner: Address = "0x1111111111111111111111111111111111111111"
            .parse()
            .unwrap();
        let log = log_with(
            vec![*TOPIC_GRID_ORDER_CREATED, topic_from_address(owner)],
            vec![
                Token::Uint(U256::from(7u64)),
                Token::Uint(U256::exp10(18)),
                Token::Uint(U256::from(42u64)),
                Token::Uint(U256::from(1u64)),
                Token::Uint(U256::from(1u64) + (U256::one() << 127)),
                Token::Uint(U256::from(2u64)),
                Token::Uint(U256::from(1u64)),
                Token::Uint(U256::from(30u64)),
                Token::Bool(false),
                Token::Bool(false),
            ],
        );

        let event = match GridExEvent::try_from_log(&log).unwrap().unwrap() {
            GridExEvent::GridOrderCreated(e) => e,
            other => panic!("unexpected event: {other:?}"),
        };
        assert_eq!(event.owner, owner);
        assert_eq!(event.pair_id, 7);
        assert_eq!(event.amount, U256::exp10(18));
        assert_eq!(event.grid_id, 42);
        assert_eq!(event.asks, 2);
        assert_eq!(event.bids, 1);
        assert_eq!(event.fee, 30);
        assert!(!event.compound);
        assert!(!event.oneshot);
    }

    #[test]
    fn test_decode_filled_order() {
        let taker: Address = "0x2222222222222222222222222222222222222222"
            .parse()
            .unwrap();
        let grid_order_id = to_grid_order_id(42, U256::one());
        let log = log_with(
            vec![*TOPIC_FILLED_ORDER],
            vec![
                Token::Address(taker),
                Token::Uint(grid_order_id),
                Token::Uint(U256::exp10(17) * 5u64),
                Token::Uint(U256::exp10(18) * 1000u64),
                Token::Uint(U256::exp10(17) * 5u64),
                Token::Uint(U256::exp10(18) * 1000u64),
                Token::Bool(true),
            ],
        );

        let event = match GridExEvent::try_from_log(&log).unwrap().unwrap() {
            GridExEvent::FilledOrder(e) => e,
            other => panic!("unexpected event: {other:?}"),
        };
        assert_eq!(event.taker, taker);
        assert_eq!(event.grid_order_id, grid_order_id);
        assert_eq!(event.base_amt, U256::exp10(17) * 5u64);
        assert_eq!(event.quote_vol, U256::exp10(18) * 1000u64);
        assert!(event.is_ask);
    }

    #[test]
    fn test_decode_cancel_grid_order_all_indexed() {
        let owner: Address = "0x3333333333333333333333333333333333333333"
            .parse()
            .unwrap();
        let log = log_with(
            vec![
                *TOPIC_CANCEL_GRID_ORDER,
                topic_from_address(owner),
                topic_from_u128(1),
                topic_from_u128(42),
            ],
            vec![],
        );

        let event = match GridExEvent::try_from_log(&log).unwrap().unwrap() {
            GridExEvent::CancelGridOrder(e) => e,
            other => panic!("unexpected event: {other:?}"),
        };
        assert_eq!(event.owner, owner);
        assert_eq!(event.order_id, 1);
        assert_eq!(event.grid_id, 42);
    }

    #[test]
    fn test_decode_linear_strategy_created_negative_gap() {
        let gap = I256::from(-10) * I256::exp10(36);
        let log = log_with(
            vec![*TOPIC_LINEAR_STRATEGY_CREATED],
            vec![
                Token::Bool(false),
                Token::Uint(U256::from(42u64)),
                Token::Uint(U256::from(1990u64) * U256::exp10(36)),
                Token::Int(gap.into_raw()),
            ],
        );

        let event = match GridExEvent::try_from_log(&log).unwrap().unwrap() {
            GridExEvent::LinearStrategyCreated(e) => e,
            other => panic!("unexpected event: {other:?}"),
        };
        assert!(!event.is_ask);
        assert_eq!(event.grid_id, 42);
        assert_eq!(event.price0, U256::from(1990u64) * U256::exp10(36));
        assert_eq!(event.gap, gap);
    }

    #[test]
    fn test_unknown_topic_is_ignored() {
        let log = log_with(vec![H256::repeat_byte(0xfe)], vec![]);
        assert!(GridExEvent::try_from_log(&log).unwrap().is_none());

        let no_topics = Log::default();
        assert!(GridExEvent::try_from_log(&no_topics).unwrap().is_none());
    }

    #[test]
    fn test_known_topic_bad_payload_is_error() {
        // PairCreated with the indexed topics missing entirely.
        let log = log_with(vec![*TOPIC_PAIR_CREATED], vec![]);
        assert!(GridExEvent::try_from_log(&log).is_err());
    }

    #[test]
    fn test_grid_order_id_round_trip() {
        let cases = [
            (0u128, U256::zero()),
            (42, U256::one()),
            (42, U256::from(1u64) + (U256::one() << 127)),
            (u128::MAX, (U256::one() << 128) - U256::one()),
        ];
        for (grid_id, order_id) in cases {
            let packed = to_grid_order_id(grid_id, order_id);
            let (g, o) = split_grid_order_id(packed);
            assert_eq!(g, grid_id);
            assert_eq!(o, order_id);
        }
    }
}
