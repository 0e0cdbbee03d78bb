// Copyright (c) GridEx, Inc.
// SPDX-License-Identifier: Apache-2.0

diesel::table! {
    indexer_state (chain_id) {
        chain_id -> Int8,
        last_block -> Int8,
        kafka_offset -> Int8,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    tokens (chain_id, address) {
        chain_id -> Int8,
        address -> Text,
        symbol -> Text,
        name -> Text,
        decimals -> Int4,
        logo -> Text,
        create_block -> Int8,
        update_block -> Int8,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    pairs (chain_id, pair_id) {
        chain_id -> Int8,
        pair_id -> Int4,
        base_token -> Text,
        base_token_address -> Text,
        quote_token -> Text,
        quote_token_address -> Text,
        active_grids -> Int4,
        volume_24h -> Text,
        trades_24h -> Int8,
        create_block -> Int8,
        update_block -> Int8,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    grids (chain_id, grid_id) {
        chain_id -> Int8,
        grid_id -> Int8,
        owner -> Text,
        pair_id -> Int4,
        base_token -> Text,
        quote_token -> Text,
        ask_order_count -> Int4,
        bid_order_count -> Int4,
        initial_base_amount -> Text,
        initial_quote_amount -> Text,
        fee -> Int4,
        compound -> Bool,
        oneshot -> Bool,
        status -> Int4,
        ask_price0 -> Text,
        ask_gap -> Text,
        bid_price0 -> Text,
        bid_gap -> Text,
        profits -> Text,
        create_block -> Int8,
        update_block -> Int8,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    orders (chain_id, order_id) {
        chain_id -> Int8,
        order_id -> Text,
        grid_id -> Int8,
        pair_id -> Int4,
        is_ask -> Bool,
        compound -> Bool,
        oneshot -> Bool,
        fee -> Int4,
        status -> Int4,
        amount -> Text,
        rev_amount -> Text,
        initial_base_amount -> Text,
        initial_quote_amount -> Text,
        price -> Text,
        rev_price -> Text,
        create_block -> Int8,
        update_block -> Int8,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    order_fills (chain_id, tx_hash, order_id, log_index) {
        chain_id -> Int8,
        tx_hash -> Text,
        order_id -> Text,
        log_index -> Int8,
        taker -> Text,
        pair_id -> Int4,
        filled_amount -> Text,
        filled_volume -> Text,
        is_ask -> Bool,
        timestamp -> Timestamp,
        create_block -> Int8,
    }
}

diesel::table! {
    protocol_stats (chain_id, date) {
        chain_id -> Int8,
        date -> Date,
        total_volume -> Text,
        total_tvl -> Text,
        total_grids -> Int8,
        active_grids -> Int8,
        total_trades -> Int8,
        total_profit -> Text,
        unique_owners -> Int8,
        block_number -> Int8,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    pair_daily_stats (chain_id, pair_id, date) {
        chain_id -> Int8,
        pair_id -> Int4,
        date -> Date,
        volume -> Text,
        trades -> Int8,
        block_number -> Int8,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    leaderboard (chain_id, period, grid_id) {
        chain_id -> Int8,
        period -> Text,
        grid_id -> Int8,
        rank -> Int8,
        owner -> Text,
        pair_id -> Int4,
        profits -> Text,
        profit_rate -> Float8,
        volume -> Text,
        trades -> Int8,
        tvl -> Text,
        apr -> Float8,
        block_number -> Int8,
        updated_at -> Timestamp,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    indexer_state,
    tokens,
    pairs,
    grids,
    orders,
    order_fills,
    protocol_stats,
    pair_daily_stats,
    leaderboard,
);
