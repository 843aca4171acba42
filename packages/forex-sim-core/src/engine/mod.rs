//! Position engine.
//!
//! P&L is `pips * lot_size * pip_value_per_lot` with
//! `pips = (current - entry) * 10000`, negated for SELL. Margin is
//! `lot_size * margin_per_lot`. Account margin, free margin, equity and
//! margin level are always re-derived from the open positions.

mod book;
mod tick;

pub use book::{BookSummary, PositionEngine, TradeRequest};
pub use tick::{advance, Settlement, SimulationState, TickOutcome};

use crate::config::SimConfig;
use serde::{Deserialize, Serialize};

/// Contract constants used by the engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct EngineSettings {
    pub margin_per_lot: f64,
    pub pip_value_per_lot: f64,
    pub risk_management: bool,
}

impl EngineSettings {
    pub fn required_margin(&self, lot_size: f64) -> f64 {
        lot_size * self.margin_per_lot
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&SimConfig::default())
    }
}

impl From<&SimConfig> for EngineSettings {
    fn from(config: &SimConfig) -> Self {
        Self {
            margin_per_lot: config.margin_per_lot,
            pip_value_per_lot: config.pip_value_per_lot,
            risk_management: config.risk_management,
        }
    }
}
