// Copyright (c) GridEx, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Insertable row types. Amount and price columns hold decimal strings;
//! aggregates cast them to NUMERIC.

use chrono::NaiveDateTime;
use diesel::prelude::*;

use super::schema::{grids, order_fills, orders, pairs, tokens};

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = tokens)]
pub struct NewToken {
    pub chain_id: i64,
    pub address: String,
    pub symbol: String,
    pub name: String,
    pub decimals: i32,
    pub logo: String,
    pub create_block: i64,
    pub update_block: i64,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = pairs)]
pub struct NewPair {
    pub chain_id: i64,
    pub pair_id: i32,
    pub base_token: String,
    pub base_token_address: String,
    pub quote_token: String,
    pub quote_token_address: String,
    pub create_block: i64,
    pub update_block: i64,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = grids)]
pub struct NewGrid {
    pub chain_id: i64,
    pub grid_id: i64,
    pub owner: String,
    pub pair_id: i32,
    pub base_token: String,
    pub quote_token: String,
    pub ask_order_count: i32,
    pub bid_order_count: i32,
    pub initial_base_amount: String,
    pub initial_quote_amount: String,
    pub fee: i32,
    pub compound: bool,
    pub oneshot: bool,
    pub status: i32,
    pub ask_price0: String,
    pub ask_gap: String,
    pub bid_price0: String,
    pub bid_gap: String,
    pub profits: String,
    pub create_block: i64,
    pub update_block: i64,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = orders)]
pub struct NewOrder {
    pub chain_id: i64,
    pub order_id: String,
    pub grid_id: i64,
    pub pair_id: i32,
    pub is_ask: bool,
    pub compound: bool,
    pub oneshot: bool,
    pub fee: i32,
    pub status: i32,
    pub amount: String,
    pub rev_amount: String,
    pub initial_base_amount: String,
    pub initial_quote_amount: String,
    pub price: String,
    pub rev_price: String,
    pub create_block: i64,
    pub update_block: i64,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = order_fills)]
pub struct NewOrderFill {
    pub chain_id: i64,
    pub tx_hash: String,
    pub order_id: String,
    pub log_index: i64,
    pub taker: String,
    pub pair_id: i32,
    pub filled_amount: String,
    pub filled_volume: String,
    pub is_ask: bool,
    pub timestamp: NaiveDateTime,
    pub create_block: i64,
}

/// Token metadata as cached in memory and warmed up from the database.
#[derive(Debug, Clone, Queryable)]
pub struct TokenRow {
    pub address: String,
    pub symbol: String,
    pub name: String,
    pub decimals: i32,
}
