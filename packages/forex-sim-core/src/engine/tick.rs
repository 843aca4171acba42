//! Tick evaluation as a pure state transition.

use super::EngineSettings;
use crate::feed::PriceSource;
use crate::types::{CloseReason, Direction, Position, TradingAccount};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Account plus position book at a tick boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationState {
    pub account: TradingAccount,
    pub positions: Vec<Position>,
}

/// A position leaving the book.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Settlement {
    pub position_id: String,
    pub pair: String,
    pub direction: Direction,
    pub lot_size: f64,
    pub reason: CloseReason,
    pub exit_price: f64,
    pub realized_pnl: f64,
    pub released_margin: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickOutcome {
    pub state: SimulationState,
    /// Positions closed by stop-loss or take-profit during this tick
    pub settlements: Vec<Settlement>,
}

/// Evaluate every open position against `prices`.
///
/// Breached positions close at the tick price and realize into the balance.
/// The rest are marked to market. Pairs without a price keep their last mark.
pub fn advance<P>(
    state: SimulationState,
    prices: &P,
    settings: &EngineSettings,
    now: DateTime<Utc>,
) -> TickOutcome
where
    P: PriceSource + ?Sized,
{
    let SimulationState {
        mut account,
        mut positions,
    } = state;
    let mut settlements = Vec::new();

    for position in positions.iter_mut().filter(|p| p.is_open()) {
        let Some(price) = prices.price(&position.pair) else {
            continue;
        };

        match position.breach(price) {
            Some(reason) => {
                settlements.push(settle(
                    position,
                    &mut account,
                    price,
                    reason,
                    settings,
                    now,
                ));
            }
            None => position.mark(price, settings.pip_value_per_lot),
        }
    }

    reconcile(&mut account, &positions, settings);

    TickOutcome {
        state: SimulationState { account, positions },
        settlements,
    }
}

/// Close `position` and realize its P&L into `account.balance`.
///
/// Derived account fields are left for the caller to reconcile.
pub(crate) fn settle(
    position: &mut Position,
    account: &mut TradingAccount,
    price: f64,
    reason: CloseReason,
    settings: &EngineSettings,
    now: DateTime<Utc>,
) -> Settlement {
    position.close(price, settings.pip_value_per_lot, reason, now);
    account.balance += position.pnl;

    tracing::info!(
        "Closed {} {} {} lots at {} ({:?}), pnl {:.2}",
        position.direction,
        position.pair,
        position.lot_size,
        price,
        reason,
        position.pnl
    );

    Settlement {
        position_id: position.id.clone(),
        pair: position.pair.clone(),
        direction: position.direction,
        lot_size: position.lot_size,
        reason,
        exit_price: price,
        realized_pnl: position.pnl,
        released_margin: settings.required_margin(position.lot_size),
    }
}

/// Derive margin and floating P&L from the open positions.
pub(crate) fn reconcile(
    account: &mut TradingAccount,
    positions: &[Position],
    settings: &EngineSettings,
) {
    let (margin, floating) = positions
        .iter()
        .filter(|p| p.is_open())
        .fold((0.0, 0.0), |(margin, floating), p| {
            (margin + settings.required_margin(p.lot_size), floating + p.pnl)
        });
    account.reconcile(margin, floating);
}
