//! Core data types for the forex simulation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Price distance of one pip, expressed as a multiplier on a raw price delta.
pub const PIP_MULTIPLIER: f64 = 10_000.0;

/// Subscription plan attached to a user.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    #[default]
    Free,
    Elite,
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Plan::Free => write!(f, "free"),
            Plan::Elite => write!(f, "elite"),
        }
    }
}

impl FromStr for Plan {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "free" => Ok(Plan::Free),
            "elite" => Ok(Plan::Elite),
            other => Err(crate::Error::Validation(format!("Unknown plan: {}", other))),
        }
    }
}

/// A registered demo user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Opaque user identifier
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    /// Normalized (trimmed, lowercase) email, unique across users
    pub email: String,
    pub plan: Plan,
    pub created_at: DateTime<Utc>,
    /// SHA-256 digest of the credentials, hex encoded
    pub password_digest: String,
}

impl User {
    /// Full display name.
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// Account snapshot for one user.
///
/// `equity`, `margin`, `free_margin` and `margin_level` are derived values.
/// They are only ever written by [`TradingAccount::reconcile`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TradingAccount {
    /// Realized cash
    pub balance: f64,
    /// Balance plus floating P&L
    pub equity: f64,
    /// Sum of unrealized P&L across open positions
    #[serde(rename = "floatingPnL")]
    pub floating_pnl: f64,
    /// Cash reserved by open positions
    pub margin: f64,
    /// Capital available for new positions
    pub free_margin: f64,
    /// Equity / margin * 100, or 0 without margin
    pub margin_level: f64,
    /// Lifetime trade count
    pub trades_count: u32,
    /// Trades opened since `last_trade_reset`
    pub daily_trades_used: u32,
    pub last_trade_reset: DateTime<Utc>,
}

impl TradingAccount {
    /// Create a fresh account holding `starting_balance` in cash.
    pub fn new(starting_balance: f64, now: DateTime<Utc>) -> Self {
        Self {
            balance: starting_balance,
            equity: starting_balance,
            floating_pnl: 0.0,
            margin: 0.0,
            free_margin: starting_balance,
            margin_level: 0.0,
            trades_count: 0,
            daily_trades_used: 0,
            last_trade_reset: now,
        }
    }

    /// Recompute every derived field from the reserved margin and floating P&L.
    pub fn reconcile(&mut self, margin: f64, floating_pnl: f64) {
        self.margin = margin;
        self.floating_pnl = floating_pnl;
        self.equity = self.balance + floating_pnl;
        self.free_margin = self.equity - margin;
        self.margin_level = if margin > 0.0 {
            self.equity / margin * 100.0
        } else {
            0.0
        };
    }

    /// Count one executed trade.
    pub fn count_trade(&mut self) {
        self.daily_trades_used += 1;
        self.trades_count += 1;
    }

    /// Whether the daily counter belongs to a calendar day before `now`.
    pub fn needs_daily_reset(&self, now: DateTime<Utc>) -> bool {
        self.last_trade_reset.date_naive() != now.date_naive()
    }
}

/// Trade direction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    /// +1 for long, -1 for short.
    pub fn sign(self) -> f64 {
        match self {
            Direction::Buy => 1.0,
            Direction::Sell => -1.0,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Buy => write!(f, "BUY"),
            Direction::Sell => write!(f, "SELL"),
        }
    }
}

impl FromStr for Direction {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "BUY" | "LONG" => Ok(Direction::Buy),
            "SELL" | "SHORT" => Ok(Direction::Sell),
            other => Err(crate::Error::Validation(format!(
                "Unknown direction: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

/// Why a position left the book.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    Manual,
    StopLoss,
    TakeProfit,
}

/// P&L in account currency for a price move on `lot_size` lots.
///
/// A fixed pip value per lot is used for every pair, JPY crosses included.
pub fn pnl(direction: Direction, entry: f64, current: f64, lot_size: f64, pip_value: f64) -> f64 {
    let pips = (current - entry) * PIP_MULTIPLIER * direction.sign();
    pips * lot_size * pip_value
}

/// A simulated position.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub id: String,
    /// Instrument pair, e.g. `EUR/USD`
    pub pair: String,
    pub direction: Direction,
    /// Lot size (positive)
    pub lot_size: f64,
    pub entry_price: f64,
    pub current_price: f64,
    /// Unrealized while open, realized once closed
    pub pnl: f64,
    pub opened_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    pub status: PositionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<CloseReason>,
}

impl Position {
    /// Open a new position at `entry_price`.
    pub fn open(
        pair: &str,
        direction: Direction,
        lot_size: f64,
        entry_price: f64,
        opened_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            pair: pair.to_uppercase(),
            direction,
            lot_size,
            entry_price,
            current_price: entry_price,
            pnl: 0.0,
            opened_at,
            closed_at: None,
            status: PositionStatus::Open,
            stop_loss: None,
            take_profit: None,
            close_reason: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Mark the position to `price`.
    pub fn mark(&mut self, price: f64, pip_value: f64) {
        self.current_price = price;
        self.pnl = pnl(
            self.direction,
            self.entry_price,
            price,
            self.lot_size,
            pip_value,
        );
    }

    /// Stop-loss or take-profit hit at `price`, stop-loss checked first.
    pub fn breach(&self, price: f64) -> Option<CloseReason> {
        let (stop_hit, target_hit) = match self.direction {
            Direction::Buy => (
                self.stop_loss.is_some_and(|sl| price <= sl),
                self.take_profit.is_some_and(|tp| price >= tp),
            ),
            Direction::Sell => (
                self.stop_loss.is_some_and(|sl| price >= sl),
                self.take_profit.is_some_and(|tp| price <= tp),
            ),
        };

        if stop_hit {
            Some(CloseReason::StopLoss)
        } else if target_hit {
            Some(CloseReason::TakeProfit)
        } else {
            None
        }
    }

    /// Move the position to its terminal state, realizing P&L at `price`.
    pub fn close(&mut self, price: f64, pip_value: f64, reason: CloseReason, at: DateTime<Utc>) {
        self.mark(price, pip_value);
        self.status = PositionStatus::Closed;
        self.close_reason = Some(reason);
        self.closed_at = Some(at);
    }
}

/// Synthetic quote for one pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub pair: String,
    pub price: f64,
    /// Absolute change since the previous tick
    pub change: f64,
    /// Percent change since the previous tick
    pub change_percent: f64,
    pub updated_at: DateTime<Utc>,
}

impl Quote {
    /// JPY-quoted pairs are displayed with two decimals instead of four.
    pub fn is_jpy_quoted(&self) -> bool {
        is_jpy_quoted(&self.pair)
    }
}

pub(crate) fn is_jpy_quoted(pair: &str) -> bool {
    pair.to_uppercase().ends_with("JPY")
}

/// API response wrapper used by the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    /// Create a successful response.
    pub fn ok(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    /// Create an error response.
    pub fn err(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error.into()),
        }
    }
}
