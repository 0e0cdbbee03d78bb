// Copyright (c) GridEx, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Aggregate refreshes, run inside every batch transaction after the event
//! writes. Failures here are logged by the caller and never fail the batch.

use chrono::Utc;
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Integer, Text};
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::error::IndexerResult;

use super::schema::protocol_stats;

/// Leaderboard periods with their window in hours; 0 means unbounded.
const LEADERBOARD_PERIODS: [(&str, i32); 4] = [("24h", 24), ("7d", 168), ("30d", 720), ("all", 0)];

#[derive(QueryableByName)]
struct ProtocolTotals {
    #[diesel(sql_type = Text)]
    total_volume: String,
    #[diesel(sql_type = BigInt)]
    total_trades: i64,
    #[diesel(sql_type = Text)]
    total_tvl: String,
    #[diesel(sql_type = BigInt)]
    total_grids: i64,
    #[diesel(sql_type = BigInt)]
    active_grids: i64,
    #[diesel(sql_type = Text)]
    total_profit: String,
    #[diesel(sql_type = BigInt)]
    unique_owners: i64,
}

/// Recompute protocol totals and upsert today's `protocol_stats` row.
///
/// TVL sums the quote side of every open order: `rev_amount` for asks (the
/// quote already received), `amount` for bids (the quote still offered).
pub async fn refresh_protocol_stats(
    conn: &mut AsyncPgConnection,
    chain_id: i64,
    block_number: u64,
) -> IndexerResult<()> {
    let totals: ProtocolTotals = diesel::sql_query(
        "SELECT \
           (SELECT COALESCE(SUM(filled_volume::NUMERIC), 0)::TEXT \
              FROM order_fills WHERE chain_id = $1) AS total_volume, \
           (SELECT COUNT(*) FROM order_fills WHERE chain_id = $1) AS total_trades, \
           (SELECT COALESCE(SUM((CASE WHEN is_ask THEN rev_amount ELSE amount END)::NUMERIC), 0)::TEXT \
              FROM orders WHERE chain_id = $1 AND status = 0) AS total_tvl, \
           (SELECT COUNT(*) FROM grids WHERE chain_id = $1) AS total_grids, \
           (SELECT COUNT(*) FROM grids WHERE chain_id = $1 AND status = 1) AS active_grids, \
           (SELECT COALESCE(SUM(profits::NUMERIC), 0)::TEXT \
              FROM grids WHERE chain_id = $1) AS total_profit, \
           (SELECT COUNT(DISTINCT owner) FROM grids WHERE chain_id = $1) AS unique_owners",
    )
    .bind::<BigInt, _>(chain_id)
    .get_result(conn)
    .await?;

    let today = Utc::now().date_naive();
    diesel::insert_into(protocol_stats::table)
        .values((
            protocol_stats::chain_id.eq(chain_id),
            protocol_stats::date.eq(today),
            protocol_stats::total_volume.eq(&totals.total_volume),
            protocol_stats::total_tvl.eq(&totals.total_tvl),
            protocol_stats::total_grids.eq(totals.total_grids),
            protocol_stats::active_grids.eq(totals.active_grids),
            protocol_stats::total_trades.eq(totals.total_trades),
            protocol_stats::total_profit.eq(&totals.total_profit),
            protocol_stats::unique_owners.eq(totals.unique_owners),
            protocol_stats::block_number.eq(block_number as i64),
        ))
        .on_conflict((protocol_stats::chain_id, protocol_stats::date))
        .do_update()
        .set((
            protocol_stats::total_volume.eq(&totals.total_volume),
            protocol_stats::total_tvl.eq(&totals.total_tvl),
            protocol_stats::total_grids.eq(totals.total_grids),
            protocol_stats::active_grids.eq(totals.active_grids),
            protocol_stats::total_trades.eq(totals.total_trades),
            protocol_stats::total_profit.eq(&totals.total_profit),
            protocol_stats::unique_owners.eq(totals.unique_owners),
            protocol_stats::block_number.eq(block_number as i64),
            protocol_stats::updated_at.eq(diesel::dsl::now),
        ))
        .execute(conn)
        .await?;
    Ok(())
}

/// Refresh `pairs.volume_24h` / `trades_24h` from the trailing 24-hour fill
/// window, zero out pairs with no recent fills, and upsert today's
/// `pair_daily_stats` rows.
pub async fn refresh_pair_stats(
    conn: &mut AsyncPgConnection,
    chain_id: i64,
    block_number: u64,
) -> IndexerResult<()> {
    diesel::sql_query(
        "UPDATE pairs p \
         SET volume_24h = f.vol, trades_24h = f.cnt, \
             update_block = $2, updated_at = NOW() \
         FROM (SELECT pair_id, \
                      COALESCE(SUM(filled_volume::NUMERIC), 0)::TEXT AS vol, \
                      COUNT(*) AS cnt \
                 FROM order_fills \
                WHERE chain_id = $1 AND timestamp >= NOW() - INTERVAL '24 hours' \
                GROUP BY pair_id) f \
         WHERE p.chain_id = $1 AND p.pair_id = f.pair_id",
    )
    .bind::<BigInt, _>(chain_id)
    .bind::<BigInt, _>(block_number as i64)
    .execute(conn)
    .await?;

    diesel::sql_query(
        "UPDATE pairs \
         SET volume_24h = '0', trades_24h = 0, updated_at = NOW() \
         WHERE chain_id = $1 \
           AND pair_id NOT IN (SELECT pair_id FROM order_fills \
                                WHERE chain_id = $1 \
                                  AND timestamp >= NOW() - INTERVAL '24 hours')",
    )
    .bind::<BigInt, _>(chain_id)
    .execute(conn)
    .await?;

    diesel::sql_query(
        "INSERT INTO pair_daily_stats \
           (chain_id, pair_id, date, volume, trades, block_number, updated_at) \
         SELECT $1, pair_id, CURRENT_DATE, \
                COALESCE(SUM(filled_volume::NUMERIC), 0)::TEXT, COUNT(*), $2, NOW() \
           FROM order_fills \
          WHERE chain_id = $1 AND timestamp >= NOW() - INTERVAL '24 hours' \
          GROUP BY pair_id \
         ON CONFLICT (chain_id, pair_id, date) DO UPDATE \
           SET volume = EXCLUDED.volume, trades = EXCLUDED.trades, \
               block_number = EXCLUDED.block_number, updated_at = NOW()",
    )
    .bind::<BigInt, _>(chain_id)
    .bind::<BigInt, _>(block_number as i64)
    .execute(conn)
    .await?;

    Ok(())
}

/// Rebuild the leaderboard for every period.
///
/// Active grids are ranked by accumulated profits. `profit_rate` relates
/// profits to the capital committed at creation
/// (`initial_quote + initial_base * bid_price0 / 10^36`), and `apr`
/// annualizes it over the grid's age (zero for grids younger than a day).
pub async fn refresh_leaderboard(
    conn: &mut AsyncPgConnection,
    chain_id: i64,
    block_number: u64,
) -> IndexerResult<()> {
    for (period, hours) in LEADERBOARD_PERIODS {
        diesel::sql_query(
            "DELETE FROM leaderboard \
             WHERE chain_id = $1 AND period = $2 \
               AND grid_id NOT IN (SELECT grid_id FROM grids \
                                    WHERE chain_id = $1 AND status = 1)",
        )
        .bind::<BigInt, _>(chain_id)
        .bind::<Text, _>(period)
        .execute(conn)
        .await?;

        diesel::sql_query(
            "WITH base AS ( \
               SELECT g.chain_id, g.grid_id, g.owner, g.pair_id, g.profits, g.created_at, \
                      (g.initial_quote_amount::NUMERIC \
                       + g.initial_base_amount::NUMERIC \
                         * COALESCE(NULLIF(g.bid_price0, '')::NUMERIC, 0) \
                         / POWER(10::NUMERIC, 36)) AS denom \
                 FROM grids g \
                WHERE g.chain_id = $1 AND g.status = 1 \
             ), rated AS ( \
               SELECT b.*, \
                      CASE WHEN b.denom > 0 \
                           THEN (b.profits::NUMERIC / b.denom * 100)::FLOAT8 \
                           ELSE 0 END AS profit_rate \
                 FROM base b \
             ) \
             INSERT INTO leaderboard \
               (chain_id, period, grid_id, rank, owner, pair_id, profits, profit_rate, \
                volume, trades, tvl, apr, block_number, updated_at) \
             SELECT r.chain_id, $2, r.grid_id, \
                    ROW_NUMBER() OVER (ORDER BY r.profits::NUMERIC DESC), \
                    r.owner, r.pair_id, r.profits, r.profit_rate, \
                    COALESCE(f.vol, '0'), COALESCE(f.cnt, 0), COALESCE(o.tvl, '0'), \
                    CASE WHEN NOW() - r.created_at < INTERVAL '1 day' THEN 0 \
                         ELSE r.profit_rate * 365.0 \
                              / (EXTRACT(EPOCH FROM (NOW() - r.created_at)) / 86400.0) END, \
                    $4, NOW() \
               FROM rated r \
               LEFT JOIN (SELECT o.grid_id, \
                                 COALESCE(SUM(fl.filled_volume::NUMERIC), 0)::TEXT AS vol, \
                                 COUNT(*) AS cnt \
                            FROM order_fills fl \
                            JOIN orders o ON o.chain_id = fl.chain_id \
                                         AND o.order_id = fl.order_id \
                           WHERE fl.chain_id = $1 \
                             AND ($3 = 0 OR fl.timestamp >= NOW() - make_interval(hours => $3)) \
                           GROUP BY o.grid_id) f ON f.grid_id = r.grid_id \
               LEFT JOIN (SELECT grid_id, \
                                 SUM((CASE WHEN is_ask THEN rev_amount ELSE amount END)::NUMERIC)::TEXT AS tvl \
                            FROM orders \
                           WHERE chain_id = $1 AND status = 0 \
                           GROUP BY grid_id) o ON o.grid_id = r.grid_id \
             ON CONFLICT (chain_id, period, grid_id) DO UPDATE \
               SET rank = EXCLUDED.rank, owner = EXCLUDED.owner, \
                   pair_id = EXCLUDED.pair_id, profits = EXCLUDED.profits, \
                   profit_rate = EXCLUDED.profit_rate, volume = EXCLUDED.volume, \
                   trades = EXCLUDED.trades, tvl = EXCLUDED.tvl, apr = EXCLUDED.apr, \
                   block_number = EXCLUDED.block_number, updated_at = NOW()",
        )
        .bind::<BigInt, _>(chain_id)
        .bind::<Text, _>(period)
        .bind::<Integer, _>(hours)
        .bind::<BigInt, _>(block_number as i64)
        .execute(conn)
        .await?;
    }
    Ok(())
}
