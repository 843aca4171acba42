//! Position book: trade execution, manual closes and SL/TP edits.

use super::tick::{self, SimulationState, Settlement};
use super::EngineSettings;
use crate::account::TradePermission;
use crate::feed::PriceSource;
use crate::types::{CloseReason, Direction, Position, TradingAccount};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Order ticket for a new position.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TradeRequest {
    pub pair: String,
    pub direction: Direction,
    pub lot_size: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
}

impl TradeRequest {
    pub fn new(pair: &str, direction: Direction, lot_size: f64) -> Self {
        Self {
            pair: pair.to_uppercase(),
            direction,
            lot_size,
            stop_loss: None,
            take_profit: None,
        }
    }

    pub fn with_stop_loss(mut self, stop_loss: f64) -> Self {
        self.stop_loss = Some(stop_loss);
        self
    }

    pub fn with_take_profit(mut self, take_profit: f64) -> Self {
        self.take_profit = Some(take_profit);
        self
    }
}

/// Book statistics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BookSummary {
    pub open_positions: usize,
    pub closed_positions: usize,
    pub realized_pnl: f64,
    pub floating_pnl: f64,
    pub winning_trades: usize,
    /// Share of closed positions with positive P&L
    pub win_rate_percent: f64,
}

/// Owner and only writer of the position list.
#[derive(Debug, Clone)]
pub struct PositionEngine {
    settings: EngineSettings,
    positions: Vec<Position>,
}

impl PositionEngine {
    pub fn new(settings: EngineSettings) -> Self {
        Self::with_positions(settings, Vec::new())
    }

    /// Resume from a persisted book.
    pub fn with_positions(settings: EngineSettings, positions: Vec<Position>) -> Self {
        Self {
            settings,
            positions,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    pub fn open_positions(&self) -> Vec<&Position> {
        self.positions.iter().filter(|p| p.is_open()).collect()
    }

    pub fn closed_positions(&self) -> Vec<&Position> {
        self.positions.iter().filter(|p| !p.is_open()).collect()
    }

    pub fn position(&self, id: &str) -> Option<&Position> {
        self.positions.iter().find(|p| p.id == id)
    }

    /// Replace the book, e.g. after a session change.
    pub fn replace_positions(&mut self, positions: Vec<Position>) {
        self.positions = positions;
    }

    /// Check stop-loss and take-profit sides against the current price.
    pub fn validate_risk(
        direction: Direction,
        price: f64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Result<()> {
        let reject = |msg: &str| Err(Error::TradeRejected(msg.to_string()));

        match direction {
            Direction::Buy => {
                if stop_loss.is_some_and(|sl| sl >= price) {
                    return reject("Stop loss must be below the current price for BUY orders");
                }
                if take_profit.is_some_and(|tp| tp <= price) {
                    return reject("Take profit must be above the current price for BUY orders");
                }
            }
            Direction::Sell => {
                if stop_loss.is_some_and(|sl| sl <= price) {
                    return reject("Stop loss must be above the current price for SELL orders");
                }
                if take_profit.is_some_and(|tp| tp >= price) {
                    return reject("Take profit must be below the current price for SELL orders");
                }
            }
        }
        Ok(())
    }

    /// Open a position at `price`.
    ///
    /// On rejection neither the book nor `account` changes. On success the
    /// account is reconciled; trade counters are the caller's to record.
    pub fn execute_trade(
        &mut self,
        request: &TradeRequest,
        price: f64,
        permission: &TradePermission,
        account: &mut TradingAccount,
        now: DateTime<Utc>,
    ) -> Result<Position> {
        if !(request.lot_size.is_finite() && request.lot_size > 0.0) {
            return Err(Error::Validation(
                "Lot size must be greater than zero".to_string(),
            ));
        }
        if !(price.is_finite() && price > 0.0) {
            return Err(Error::Validation(format!(
                "No valid price for {}",
                request.pair
            )));
        }

        let levels = [request.stop_loss, request.take_profit];
        if levels
            .into_iter()
            .flatten()
            .any(|level| !(level.is_finite() && level > 0.0))
        {
            return Err(Error::Validation(
                "Stop loss and take profit must be positive prices".to_string(),
            ));
        }

        if !permission.allowed {
            let message = permission
                .message
                .clone()
                .unwrap_or_else(|| "Trading is not allowed".to_string());
            warn!("Trade rejected: {}", message);
            return Err(Error::TradeRejected(message));
        }

        let required = self.settings.required_margin(request.lot_size);
        if required > account.free_margin {
            warn!(
                "Trade rejected: margin {:.2} exceeds free margin {:.2}",
                required, account.free_margin
            );
            return Err(Error::InsufficientMargin {
                needed: required,
                available: account.free_margin,
            });
        }

        if self.settings.risk_management {
            Self::validate_risk(
                request.direction,
                price,
                request.stop_loss,
                request.take_profit,
            )?;
        }

        let mut position = Position::open(
            &request.pair,
            request.direction,
            request.lot_size,
            price,
            now,
        );
        position.stop_loss = request.stop_loss;
        position.take_profit = request.take_profit;

        self.positions.push(position.clone());
        tick::reconcile(account, &self.positions, &self.settings);

        info!(
            "Opened {} {} {} lots at {} (id {})",
            position.direction, position.pair, position.lot_size, price, position.id
        );
        Ok(position)
    }

    /// Close an open position by hand. Closed or unknown ids are ignored.
    pub fn close_trade(
        &mut self,
        id: &str,
        price: f64,
        account: &mut TradingAccount,
        now: DateTime<Utc>,
    ) -> Option<Settlement> {
        let position = self
            .positions
            .iter_mut()
            .find(|p| p.id == id && p.is_open())?;

        let settlement = tick::settle(
            position,
            account,
            price,
            CloseReason::Manual,
            &self.settings,
            now,
        );
        tick::reconcile(account, &self.positions, &self.settings);
        Some(settlement)
    }

    /// Replace stop-loss and take-profit on an open position.
    ///
    /// No side check is made; a level that is already crossed closes the
    /// position on the next tick.
    pub fn modify_trade(
        &mut self,
        id: &str,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Option<&Position> {
        let position = self
            .positions
            .iter_mut()
            .find(|p| p.id == id && p.is_open())?;
        position.stop_loss = stop_loss;
        position.take_profit = take_profit;
        Some(&*position)
    }

    /// Run one tick of SL/TP evaluation against `prices`.
    pub fn evaluate<P>(
        &mut self,
        account: &mut TradingAccount,
        prices: &P,
        now: DateTime<Utc>,
    ) -> Vec<Settlement>
    where
        P: PriceSource + ?Sized,
    {
        let state = SimulationState {
            account: account.clone(),
            positions: std::mem::take(&mut self.positions),
        };
        let outcome = tick::advance(state, prices, &self.settings, now);
        *account = outcome.state.account;
        self.positions = outcome.state.positions;
        outcome.settlements
    }

    /// Re-derive the account's margin fields from this book.
    pub fn reconcile(&self, account: &mut TradingAccount) {
        tick::reconcile(account, &self.positions, &self.settings);
    }

    pub fn summary(&self) -> BookSummary {
        let closed = self.closed_positions();
        let realized_pnl = closed.iter().map(|p| p.pnl).sum();
        let winning_trades = closed.iter().filter(|p| p.pnl > 0.0).count();
        let win_rate_percent = if closed.is_empty() {
            0.0
        } else {
            winning_trades as f64 / closed.len() as f64 * 100.0
        };
        let open = self.open_positions();

        BookSummary {
            open_positions: open.len(),
            closed_positions: closed.len(),
            realized_pnl,
            floating_pnl: open.iter().map(|p| p.pnl).sum(),
            winning_trades,
            win_rate_percent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::collections::HashMap;

    fn engine() -> PositionEngine {
        PositionEngine::new(EngineSettings::default())
    }

    fn account() -> TradingAccount {
        TradingAccount::new(100_000.0, Utc::now())
    }

    fn allowed() -> TradePermission {
        TradePermission::allowed()
    }

    fn at(pair: &str, price: f64) -> HashMap<String, f64> {
        HashMap::from([(pair.to_string(), price)])
    }

    #[test]
    fn test_execute_trade_reserves_margin() {
        let mut engine = engine();
        let mut account = account();

        let request = TradeRequest::new("EUR/USD", Direction::Buy, 2.0);
        let position = engine
            .execute_trade(&request, 1.0850, &allowed(), &mut account, Utc::now())
            .unwrap();

        assert!(position.is_open());
        assert_eq!(position.entry_price, 1.0850);
        assert_eq!(position.pnl, 0.0);
        assert_eq!(account.margin, 2_000.0);
        assert_eq!(account.free_margin, 98_000.0);
        assert_eq!(account.equity, 100_000.0);
        assert_abs_diff_eq!(account.margin_level, 5_000.0, epsilon = 1e-9);
        assert_eq!(engine.open_positions().len(), 1);
    }

    #[test]
    fn test_insufficient_margin_changes_nothing() {
        let mut engine = engine();
        let mut account = account();
        let before = account.clone();

        let request = TradeRequest::new("EUR/USD", Direction::Buy, 100.5);
        let result = engine.execute_trade(&request, 1.0850, &allowed(), &mut account, Utc::now());

        assert!(matches!(result, Err(Error::InsufficientMargin { .. })));
        assert!(engine.positions().is_empty());
        assert_eq!(account, before);
    }

    #[test]
    fn test_exact_free_margin_is_accepted() {
        let mut engine = engine();
        let mut account = account();

        let request = TradeRequest::new("EUR/USD", Direction::Buy, 100.0);
        assert!(engine
            .execute_trade(&request, 1.0850, &allowed(), &mut account, Utc::now())
            .is_ok());
        assert_eq!(account.free_margin, 0.0);
    }

    #[test]
    fn test_non_finite_levels_rejected() {
        let mut engine = engine();
        let mut account = account();
        let before = account.clone();

        let requests = [
            TradeRequest::new("EUR/USD", Direction::Buy, 1.0).with_stop_loss(f64::NAN),
            TradeRequest::new("EUR/USD", Direction::Buy, 1.0).with_take_profit(f64::INFINITY),
            TradeRequest::new("EUR/USD", Direction::Sell, 1.0).with_take_profit(f64::NAN),
            TradeRequest::new("EUR/USD", Direction::Sell, 1.0).with_stop_loss(-1.0),
        ];
        for request in &requests {
            let result = engine.execute_trade(request, 1.0850, &allowed(), &mut account, Utc::now());
            assert!(matches!(result, Err(Error::Validation(_))), "{:?}", request);
        }

        // Checked even with risk management off
        let mut unchecked = PositionEngine::new(EngineSettings {
            risk_management: false,
            ..EngineSettings::default()
        });
        let request = TradeRequest::new("EUR/USD", Direction::Buy, 1.0).with_stop_loss(f64::NAN);
        assert!(unchecked
            .execute_trade(&request, 1.0850, &allowed(), &mut account, Utc::now())
            .is_err());

        assert!(engine.positions().is_empty());
        assert!(unchecked.positions().is_empty());
        assert_eq!(account, before);
    }

    #[test]
    fn test_denied_permission() {
        let mut engine = engine();
        let mut account = account();

        let request = TradeRequest::new("EUR/USD", Direction::Buy, 1.0);
        let permission = TradePermission::denied("Daily trade limit reached");
        let result = engine.execute_trade(&request, 1.0850, &permission, &mut account, Utc::now());

        match result {
            Err(Error::TradeRejected(msg)) => assert_eq!(msg, "Daily trade limit reached"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(engine.positions().is_empty());
    }

    #[test]
    fn test_invalid_lot_size() {
        let mut engine = engine();
        let mut account = account();

        for lot in [0.0, -1.0, f64::NAN] {
            let request = TradeRequest::new("EUR/USD", Direction::Buy, lot);
            let result =
                engine.execute_trade(&request, 1.0850, &allowed(), &mut account, Utc::now());
            assert!(matches!(result, Err(Error::Validation(_))));
        }
    }

    #[test]
    fn test_risk_validation_buy() {
        let mut engine = engine();
        let mut account = account();

        let above = TradeRequest::new("EUR/USD", Direction::Buy, 1.0).with_stop_loss(1.0860);
        let result = engine.execute_trade(&above, 1.0850, &allowed(), &mut account, Utc::now());
        assert!(matches!(result, Err(Error::TradeRejected(_))));
        assert!(engine.positions().is_empty());

        let below = TradeRequest::new("EUR/USD", Direction::Buy, 1.0).with_stop_loss(1.0840);
        let position = engine
            .execute_trade(&below, 1.0850, &allowed(), &mut account, Utc::now())
            .unwrap();
        assert_eq!(position.stop_loss, Some(1.0840));
    }

    #[test]
    fn test_risk_validation_sell() {
        assert!(PositionEngine::validate_risk(
            Direction::Sell,
            1.0850,
            Some(1.0860),
            Some(1.0800)
        )
        .is_ok());
        assert!(PositionEngine::validate_risk(Direction::Sell, 1.0850, Some(1.0840), None).is_err());
        assert!(PositionEngine::validate_risk(Direction::Sell, 1.0850, None, Some(1.0900)).is_err());
        assert!(PositionEngine::validate_risk(Direction::Buy, 1.0850, None, Some(1.0850)).is_err());
    }

    #[test]
    fn test_risk_validation_disabled() {
        let settings = EngineSettings {
            risk_management: false,
            ..Default::default()
        };
        let mut engine = PositionEngine::new(settings);
        let mut account = account();

        let request = TradeRequest::new("EUR/USD", Direction::Buy, 1.0).with_stop_loss(1.0900);
        assert!(engine
            .execute_trade(&request, 1.0850, &allowed(), &mut account, Utc::now())
            .is_ok());
    }

    #[test]
    fn test_manual_close_settlement() {
        let mut engine = engine();
        let mut account = account();

        let request = TradeRequest::new("EUR/USD", Direction::Buy, 1.0);
        let position = engine
            .execute_trade(&request, 1.0850, &allowed(), &mut account, Utc::now())
            .unwrap();

        engine.evaluate(&mut account, &at("EUR/USD", 1.0860), Utc::now());
        let balance_before = account.balance;
        let free_before = account.free_margin;

        let settlement = engine
            .close_trade(&position.id, 1.0860, &mut account, Utc::now())
            .unwrap();

        assert_eq!(settlement.reason, CloseReason::Manual);
        assert_abs_diff_eq!(settlement.realized_pnl, 100.0, epsilon = 1e-6);
        assert_abs_diff_eq!(
            account.equity,
            balance_before + settlement.realized_pnl,
            epsilon = 1e-9
        );
        assert_abs_diff_eq!(account.free_margin, free_before + 1_000.0, epsilon = 1e-9);
        assert_eq!(account.margin, 0.0);
        assert_eq!(
            engine.position(&position.id).unwrap().close_reason,
            Some(CloseReason::Manual)
        );
    }

    #[test]
    fn test_close_is_noop_when_closed_or_unknown() {
        let mut engine = engine();
        let mut account = account();

        let request = TradeRequest::new("EUR/USD", Direction::Sell, 1.0);
        let position = engine
            .execute_trade(&request, 1.0850, &allowed(), &mut account, Utc::now())
            .unwrap();

        assert!(engine
            .close_trade(&position.id, 1.0850, &mut account, Utc::now())
            .is_some());
        let after_first = account.clone();

        assert!(engine
            .close_trade(&position.id, 1.0700, &mut account, Utc::now())
            .is_none());
        assert!(engine
            .close_trade("missing", 1.0700, &mut account, Utc::now())
            .is_none());
        assert_eq!(account, after_first);
    }

    #[test]
    fn test_modify_trade_without_revalidation() {
        let mut engine = engine();
        let mut account = account();

        let request = TradeRequest::new("EUR/USD", Direction::Buy, 1.0);
        let position = engine
            .execute_trade(&request, 1.0850, &allowed(), &mut account, Utc::now())
            .unwrap();

        // Stop above the market: accepted, fires on the next tick
        let modified = engine
            .modify_trade(&position.id, Some(1.0900), None)
            .unwrap();
        assert_eq!(modified.stop_loss, Some(1.0900));

        let settlements = engine.evaluate(&mut account, &at("EUR/USD", 1.0851), Utc::now());
        assert_eq!(settlements.len(), 1);
        assert_eq!(settlements[0].reason, CloseReason::StopLoss);

        assert!(engine.modify_trade(&position.id, None, None).is_none());
    }

    #[test]
    fn test_summary() {
        let mut engine = engine();
        let mut account = account();

        let first = engine
            .execute_trade(
                &TradeRequest::new("EUR/USD", Direction::Buy, 1.0),
                1.0850,
                &allowed(),
                &mut account,
                Utc::now(),
            )
            .unwrap();
        let second = engine
            .execute_trade(
                &TradeRequest::new("EUR/USD", Direction::Buy, 1.0),
                1.0850,
                &allowed(),
                &mut account,
                Utc::now(),
            )
            .unwrap();
        engine
            .execute_trade(
                &TradeRequest::new("EUR/USD", Direction::Sell, 1.0),
                1.0850,
                &allowed(),
                &mut account,
                Utc::now(),
            )
            .unwrap();

        engine.close_trade(&first.id, 1.0860, &mut account, Utc::now());
        engine.close_trade(&second.id, 1.0840, &mut account, Utc::now());

        let summary = engine.summary();
        assert_eq!(summary.open_positions, 1);
        assert_eq!(summary.closed_positions, 2);
        assert_eq!(summary.winning_trades, 1);
        assert_abs_diff_eq!(summary.win_rate_percent, 50.0);
        assert_abs_diff_eq!(summary.realized_pnl, 0.0, epsilon = 1e-6);
    }
}
