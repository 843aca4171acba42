//! Synthetic price feed.
//!
//! Every tick moves each pair by a uniform random step. There is no mean
//! reversion and no bound on how far a price can wander.

use crate::types::{is_jpy_quoted, Quote};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::HashMap;

/// Seed prices for the default book.
pub const DEFAULT_PAIRS: &[(&str, f64)] = &[
    ("EUR/USD", 1.0850),
    ("GBP/USD", 1.2650),
    ("USD/JPY", 149.50),
    ("USD/CHF", 0.8850),
    ("AUD/USD", 0.6550),
    ("USD/CAD", 1.3650),
    ("NZD/USD", 0.6050),
    ("EUR/GBP", 0.8580),
];

/// Anything that can quote a price for a pair.
pub trait PriceSource {
    fn price(&self, pair: &str) -> Option<f64>;
}

impl PriceSource for HashMap<String, f64> {
    fn price(&self, pair: &str) -> Option<f64> {
        self.get(&pair.to_uppercase()).copied()
    }
}

/// Round for display: 2 decimals on JPY-quoted pairs, 4 otherwise.
pub fn round_for_pair(pair: &str, value: f64) -> f64 {
    let factor = if is_jpy_quoted(pair) { 100.0 } else { 10_000.0 };
    (value * factor).round() / factor
}

#[derive(Debug, Clone)]
pub struct PriceFeed {
    quotes: Vec<Quote>,
    max_move: f64,
}

impl PriceFeed {
    /// Feed over [`DEFAULT_PAIRS`].
    pub fn new(max_move: f64) -> Self {
        Self::with_pairs(DEFAULT_PAIRS.iter().copied(), max_move)
    }

    pub fn with_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, f64)>, max_move: f64) -> Self {
        let now = Utc::now();
        let quotes = pairs
            .into_iter()
            .map(|(pair, price)| Quote {
                pair: pair.to_uppercase(),
                price,
                change: 0.0,
                change_percent: 0.0,
                updated_at: now,
            })
            .collect();
        Self { quotes, max_move }
    }

    /// Resume from previously saved quotes.
    pub fn from_quotes(quotes: Vec<Quote>, max_move: f64) -> Self {
        Self { quotes, max_move }
    }

    pub fn quotes(&self) -> &[Quote] {
        &self.quotes
    }

    pub fn quote(&self, pair: &str) -> Option<&Quote> {
        let pair = pair.to_uppercase();
        self.quotes.iter().find(|q| q.pair == pair)
    }

    pub fn pairs(&self) -> Vec<String> {
        self.quotes.iter().map(|q| q.pair.clone()).collect()
    }

    /// Snapshot of the last prices.
    pub fn prices(&self) -> HashMap<String, f64> {
        self.quotes
            .iter()
            .map(|q| (q.pair.clone(), q.price))
            .collect()
    }

    /// Set an explicit price for a tracked pair.
    pub fn set_price(&mut self, pair: &str, price: f64, now: DateTime<Utc>) -> Result<&Quote> {
        let pair = pair.to_uppercase();
        let quote = self
            .quotes
            .iter_mut()
            .find(|q| q.pair == pair)
            .ok_or_else(|| Error::UnknownPair(pair.clone()))?;
        apply(quote, price, now);
        Ok(&*quote)
    }

    /// Advance every pair by one random step.
    pub fn tick<R: Rng>(&mut self, rng: &mut R, now: DateTime<Utc>) {
        for quote in &mut self.quotes {
            let next = quote.price + rng.gen_range(-self.max_move..=self.max_move);
            apply(quote, next, now);
        }
        tracing::trace!("Price feed ticked {} pairs", self.quotes.len());
    }
}

impl PriceSource for PriceFeed {
    fn price(&self, pair: &str) -> Option<f64> {
        self.quote(pair).map(|q| q.price)
    }
}

fn apply(quote: &mut Quote, price: f64, now: DateTime<Utc>) {
    let previous = quote.price;
    let change = price - previous;
    let change_percent = if previous != 0.0 {
        change / previous * 100.0
    } else {
        0.0
    };

    quote.price = price;
    quote.change = round_for_pair(&quote.pair, change);
    quote.change_percent = round_for_pair(&quote.pair, change_percent);
    quote.updated_at = now;
}
