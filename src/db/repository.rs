// Copyright (c) GridEx, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Transaction-scoped persistence operations.
//!
//! Inserts for append-only-idempotent entities use `ON CONFLICT DO NOTHING`
//! so replaying a batch after a crash is safe. Every mutation takes the
//! transaction connection it must run on.

use diesel::prelude::*;
use diesel::sql_types::{BigInt, Integer, Text};
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::error::IndexerResult;

use super::models::{NewGrid, NewOrder, NewOrderFill, NewPair, NewToken, TokenRow};
use super::schema::{grids, indexer_state, order_fills, orders, pairs, tokens};

/// Last fully processed block for a chain, 0 if the chain has never run.
pub async fn last_block(conn: &mut AsyncPgConnection, chain_id: i64) -> IndexerResult<u64> {
    let block: Option<i64> = indexer_state::table
        .filter(indexer_state::chain_id.eq(chain_id))
        .select(indexer_state::last_block)
        .first(conn)
        .await
        .optional()?;
    Ok(block.unwrap_or(0) as u64)
}

/// Last observed Kafka tail offset for a chain, 0 if none.
pub async fn kafka_offset(conn: &mut AsyncPgConnection, chain_id: i64) -> IndexerResult<i64> {
    let offset: Option<i64> = indexer_state::table
        .filter(indexer_state::chain_id.eq(chain_id))
        .select(indexer_state::kafka_offset)
        .first(conn)
        .await
        .optional()?;
    Ok(offset.unwrap_or(0))
}

/// Advance the scan cursor. Only ever called inside a batch transaction.
pub async fn update_last_block(
    conn: &mut AsyncPgConnection,
    chain_id: i64,
    block_number: u64,
) -> IndexerResult<()> {
    diesel::insert_into(indexer_state::table)
        .values((
            indexer_state::chain_id.eq(chain_id),
            indexer_state::last_block.eq(block_number as i64),
        ))
        .on_conflict(indexer_state::chain_id)
        .do_update()
        .set((
            indexer_state::last_block.eq(block_number as i64),
            indexer_state::updated_at.eq(diesel::dsl::now),
        ))
        .execute(conn)
        .await?;
    Ok(())
}

/// Store the Kafka tail offset alongside the cursor.
pub async fn update_kafka_offset(
    conn: &mut AsyncPgConnection,
    chain_id: i64,
    offset: i64,
) -> IndexerResult<()> {
    diesel::insert_into(indexer_state::table)
        .values((
            indexer_state::chain_id.eq(chain_id),
            indexer_state::kafka_offset.eq(offset),
        ))
        .on_conflict(indexer_state::chain_id)
        .do_update()
        .set((
            indexer_state::kafka_offset.eq(offset),
            indexer_state::updated_at.eq(diesel::dsl::now),
        ))
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn upsert_token(conn: &mut AsyncPgConnection, token: &NewToken) -> IndexerResult<()> {
    diesel::insert_into(tokens::table)
        .values(token)
        .on_conflict((tokens::chain_id, tokens::address))
        .do_update()
        .set((
            tokens::symbol.eq(&token.symbol),
            tokens::name.eq(&token.name),
            tokens::decimals.eq(token.decimals),
            tokens::update_block.eq(token.update_block),
            tokens::updated_at.eq(diesel::dsl::now),
        ))
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn insert_pair(conn: &mut AsyncPgConnection, pair: &NewPair) -> IndexerResult<()> {
    diesel::insert_into(pairs::table)
        .values(pair)
        .on_conflict_do_nothing()
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn insert_grid(conn: &mut AsyncPgConnection, grid: &NewGrid) -> IndexerResult<()> {
    diesel::insert_into(grids::table)
        .values(grid)
        .on_conflict_do_nothing()
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn insert_order(conn: &mut AsyncPgConnection, order: &NewOrder) -> IndexerResult<()> {
    diesel::insert_into(orders::table)
        .values(order)
        .on_conflict_do_nothing()
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn insert_order_fill(
    conn: &mut AsyncPgConnection,
    fill: &NewOrderFill,
) -> IndexerResult<()> {
    diesel::insert_into(order_fills::table)
        .values(fill)
        .on_conflict_do_nothing()
        .execute(conn)
        .await?;
    Ok(())
}

/// Set an order's amounts to the post-fill values carried by the event.
pub async fn update_order_on_fill(
    conn: &mut AsyncPgConnection,
    chain_id: i64,
    order_id: &str,
    new_amount: &str,
    new_rev_amount: &str,
    block_number: u64,
) -> IndexerResult<()> {
    diesel::update(
        orders::table.filter(
            orders::chain_id
                .eq(chain_id)
                .and(orders::order_id.eq(order_id)),
        ),
    )
    .set((
        orders::amount.eq(new_amount),
        orders::rev_amount.eq(new_rev_amount),
        orders::update_block.eq(block_number as i64),
        orders::updated_at.eq(diesel::dsl::now),
    ))
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn cancel_order(
    conn: &mut AsyncPgConnection,
    chain_id: i64,
    order_id: &str,
    block_number: u64,
) -> IndexerResult<()> {
    diesel::update(
        orders::table.filter(
            orders::chain_id
                .eq(chain_id)
                .and(orders::order_id.eq(order_id)),
        ),
    )
    .set((
        orders::status.eq(2),
        orders::update_block.eq(block_number as i64),
        orders::updated_at.eq(diesel::dsl::now),
    ))
    .execute(conn)
    .await?;
    Ok(())
}

/// Cancel a grid and cascade the cancellation to all its orders.
pub async fn cancel_grid(
    conn: &mut AsyncPgConnection,
    chain_id: i64,
    grid_id: i64,
    block_number: u64,
) -> IndexerResult<()> {
    diesel::update(
        grids::table.filter(
            grids::chain_id
                .eq(chain_id)
                .and(grids::grid_id.eq(grid_id)),
        ),
    )
    .set((
        grids::status.eq(2),
        grids::update_block.eq(block_number as i64),
        grids::updated_at.eq(diesel::dsl::now),
    ))
    .execute(conn)
    .await?;

    diesel::update(
        orders::table.filter(
            orders::chain_id
                .eq(chain_id)
                .and(orders::grid_id.eq(grid_id)),
        ),
    )
    .set((
        orders::status.eq(2),
        orders::update_block.eq(block_number as i64),
        orders::updated_at.eq(diesel::dsl::now),
    ))
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn update_grid_fee(
    conn: &mut AsyncPgConnection,
    chain_id: i64,
    grid_id: i64,
    fee: i32,
    block_number: u64,
) -> IndexerResult<()> {
    diesel::update(
        grids::table.filter(
            grids::chain_id
                .eq(chain_id)
                .and(grids::grid_id.eq(grid_id)),
        ),
    )
    .set((
        grids::fee.eq(fee),
        grids::update_block.eq(block_number as i64),
        grids::updated_at.eq(diesel::dsl::now),
    ))
    .execute(conn)
    .await?;
    Ok(())
}

/// Add `amount` (a decimal string) to a grid's accumulated profits. The
/// arbitrary-precision addition happens in NUMERIC on the database side.
pub async fn add_grid_profits(
    conn: &mut AsyncPgConnection,
    chain_id: i64,
    grid_id: i64,
    amount: &str,
    block_number: u64,
) -> IndexerResult<()> {
    diesel::sql_query(
        "UPDATE grids \
         SET profits = (CAST(profits AS NUMERIC) + CAST($1 AS NUMERIC))::TEXT, \
             update_block = $2, updated_at = NOW() \
         WHERE chain_id = $3 AND grid_id = $4",
    )
    .bind::<Text, _>(amount)
    .bind::<BigInt, _>(block_number as i64)
    .bind::<BigInt, _>(chain_id)
    .bind::<BigInt, _>(grid_id)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn increment_pair_active_grids(
    conn: &mut AsyncPgConnection,
    chain_id: i64,
    pair_id: i32,
    block_number: u64,
) -> IndexerResult<()> {
    diesel::update(
        pairs::table.filter(
            pairs::chain_id
                .eq(chain_id)
                .and(pairs::pair_id.eq(pair_id)),
        ),
    )
    .set((
        pairs::active_grids.eq(pairs::active_grids + 1),
        pairs::update_block.eq(block_number as i64),
        pairs::updated_at.eq(diesel::dsl::now),
    ))
    .execute(conn)
    .await?;
    Ok(())
}

/// Decrement a pair's active grid counter, clamped at zero.
pub async fn decrement_pair_active_grids(
    conn: &mut AsyncPgConnection,
    chain_id: i64,
    pair_id: i32,
    block_number: u64,
) -> IndexerResult<()> {
    diesel::sql_query(
        "UPDATE pairs \
         SET active_grids = GREATEST(active_grids - 1, 0), \
             update_block = $1, updated_at = NOW() \
         WHERE chain_id = $2 AND pair_id = $3",
    )
    .bind::<BigInt, _>(block_number as i64)
    .bind::<BigInt, _>(chain_id)
    .bind::<Integer, _>(pair_id)
    .execute(conn)
    .await?;
    Ok(())
}

/// Pair of the given grid. Used for the active-grids decrement on
/// whole-grid cancellation.
pub async fn grid_pair_id(
    conn: &mut AsyncPgConnection,
    chain_id: i64,
    grid_id: i64,
) -> IndexerResult<Option<i32>> {
    Ok(grids::table
        .filter(
            grids::chain_id
                .eq(chain_id)
                .and(grids::grid_id.eq(grid_id)),
        )
        .select(grids::pair_id)
        .first(conn)
        .await
        .optional()?)
}

/// Pair of the order a fill references.
pub async fn order_pair_id(
    conn: &mut AsyncPgConnection,
    chain_id: i64,
    order_id: &str,
) -> IndexerResult<Option<i32>> {
    Ok(orders::table
        .filter(
            orders::chain_id
                .eq(chain_id)
                .and(orders::order_id.eq(order_id)),
        )
        .select(orders::pair_id)
        .first(conn)
        .await
        .optional()?)
}

/// All known tokens of a chain, for warming the in-memory cache on restart.
pub async fn tokens_by_chain(
    conn: &mut AsyncPgConnection,
    chain_id: i64,
) -> IndexerResult<Vec<TokenRow>> {
    Ok(tokens::table
        .filter(tokens::chain_id.eq(chain_id))
        .select((
            tokens::address,
            tokens::symbol,
            tokens::name,
            tokens::decimals,
        ))
        .load(conn)
        .await?)
}
