// Copyright (c) GridEx, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Order price and amount derivations for linear grid strategies.
//!
//! All arithmetic is arbitrary precision: the product in
//! `floor(base_amt * price / 10^36)` can exceed 256 bits for legitimate
//! on-chain values. Results cross the DB and Kafka boundaries as decimal
//! strings.

use ethers::types::{I256, U256};
use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::Zero;
use once_cell::sync::Lazy;
use std::str::FromStr;

/// `PRICE_MULTIPLIER` of the exchange contract: prices carry 36 decimals.
static PRICE_MULTIPLIER: Lazy<BigInt> = Lazy::new(|| BigInt::from(10).pow(36));

pub fn u256_to_bigint(value: U256) -> BigInt {
    BigInt::from_str(&value.to_string()).expect("U256 decimal form is a valid BigInt")
}

pub fn i256_to_bigint(value: I256) -> BigInt {
    BigInt::from_str(&value.to_string()).expect("I256 decimal form is a valid BigInt")
}

/// Price of the i-th order on a side: `price0 + gap * i`.
pub fn order_price(price0: &BigInt, gap: &BigInt, index: u32) -> BigInt {
    price0 + gap * BigInt::from(index)
}

/// `floor(base_amt * price / 10^36)`, the quote amount a bid at `price`
/// commits for `base_amt` of base.
pub fn calc_quote_amount(base_amt: &BigInt, price: &BigInt) -> BigInt {
    (base_amt * price).div_floor(&PRICE_MULTIPLIER)
}

/// Initial funding of a grid: `base_amt * ask_count` of base, and the sum of
/// the per-bid quote amounts at each bid price.
pub fn calc_initial_amounts(
    base_amt: &BigInt,
    bid_price0: &BigInt,
    bid_gap: &BigInt,
    ask_count: u32,
    bid_count: u32,
) -> (BigInt, BigInt) {
    let initial_base = base_amt * BigInt::from(ask_count);

    let mut initial_quote = BigInt::zero();
    for i in 0..bid_count {
        let price = order_price(bid_price0, bid_gap, i);
        initial_quote += calc_quote_amount(base_amt, &price);
    }

    (initial_base, initial_quote)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn big(s: &str) -> BigInt {
        BigInt::from_str(s).unwrap()
    }

    fn price_units(n: i64) -> BigInt {
        BigInt::from(n) * BigInt::from(10).pow(36)
    }

    #[test]
    fn test_ask_prices_are_linear() {
        // ask_price0 = 2000e36, gap = 10e36
        let price0 = price_units(2000);
        let gap = price_units(10);

        assert_eq!(order_price(&price0, &gap, 0), price_units(2000));
        assert_eq!(order_price(&price0, &gap, 1), price_units(2010));
        assert_eq!(order_price(&price0, &gap, 5), price_units(2050));
    }

    #[test]
    fn test_bid_prices_with_negative_gap() {
        // bid_price0 = 1990e36, gap = -10e36
        let price0 = price_units(1990);
        let gap = price_units(-10);

        assert_eq!(order_price(&price0, &gap, 0), price_units(1990));
        assert_eq!(order_price(&price0, &gap, 1), price_units(1980));
        assert_eq!(order_price(&price0, &gap, 3), price_units(1960));
    }

    #[test]
    fn test_calc_quote_amount_floors() {
        // 1e18 base at price 1990e36 -> 1990e18 quote, exactly.
        let base = big("1000000000000000000");
        let quote = calc_quote_amount(&base, &price_units(1990));
        assert_eq!(quote, big("1990000000000000000000"));

        // 3 base units at a price of 10^36 / 2 -> floor(1.5) = 1.
        let half = BigInt::from(10).pow(36) / 2;
        assert_eq!(calc_quote_amount(&BigInt::from(3), &half), BigInt::from(1));
    }

    #[test]
    fn test_calc_quote_amount_survives_256_bit_products() {
        // base and price both near 2^255: the product needs ~510 bits.
        let base = BigInt::from(2).pow(255);
        let price = BigInt::from(2).pow(255);
        let expected = (BigInt::from(2).pow(510)).div_floor(&(BigInt::from(10).pow(36)));
        assert_eq!(calc_quote_amount(&base, &price), expected);
    }

    #[test]
    fn test_initial_amounts() {
        // Grid with 2 asks, 1 bid, base amount 1e18, bid_price0 = 1990e36.
        let base = big("1000000000000000000");
        let (initial_base, initial_quote) =
            calc_initial_amounts(&base, &price_units(1990), &price_units(-10), 2, 1);

        assert_eq!(initial_base, big("2000000000000000000"));
        assert_eq!(initial_quote, big("1990000000000000000000"));
    }

    #[test]
    fn test_initial_amounts_sum_over_bids() {
        // Two bids at 1990 and 1980 -> quote = (1990 + 1980) per base unit.
        let base = big("1000000000000000000");
        let (_, initial_quote) =
            calc_initial_amounts(&base, &price_units(1990), &price_units(-10), 0, 2);
        assert_eq!(initial_quote, big("3970000000000000000000"));
    }

    #[test]
    fn test_zero_counts() {
        let base = big("1000000000000000000");
        let (initial_base, initial_quote) =
            calc_initial_amounts(&base, &BigInt::zero(), &BigInt::zero(), 0, 0);
        assert!(initial_base.is_zero());
        assert!(initial_quote.is_zero());
    }

    #[test]
    fn test_u256_i256_conversions() {
        assert_eq!(u256_to_bigint(U256::exp10(18)), big("1000000000000000000"));
        assert_eq!(
            i256_to_bigint(I256::from(-10) * I256::exp10(36)),
            price_units(-10)
        );
    }
}
