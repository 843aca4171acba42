//! Forex Sim Core - mock forex paper trading.
//!
//! This crate provides the demo trading simulation behind the Isaac Solutions
//! trading dashboard:
//!
//! - **Accounts**: signup/login, plans and daily trade limits, persisted
//!   through a swappable key/value store
//! - **Position engine**: open/close/modify positions, P&L, stop-loss and
//!   take-profit evaluation
//! - **Price feed**: synthetic random-walk quotes
//! - **Simulation**: the tick driver tying the three together
//!
//! # Example
//!
//! ```rust,no_run
//! use forex_sim_core::account::{MemoryStore, SignupRequest};
//! use forex_sim_core::engine::TradeRequest;
//! use forex_sim_core::{Direction, SimConfig, Simulation};
//!
//! let mut sim = Simulation::open(MemoryStore::new(), SimConfig::default()).unwrap();
//! sim.signup(&SignupRequest::new("Ada", "Lovelace", "ada@example.com", "secret1", "secret1"))
//!     .unwrap();
//!
//! let request = TradeRequest::new("EUR/USD", Direction::Buy, 1.0).with_stop_loss(1.0800);
//! let position = sim.execute_trade(&request, chrono::Utc::now()).unwrap();
//! println!("Opened {} at {}", position.pair, position.entry_price);
//! ```

pub mod account;
pub mod config;
pub mod engine;
pub mod feed;
pub mod simulation;
pub mod types;

// Re-export commonly used types
pub use types::{
    ApiResponse, CloseReason, Direction, Plan, Position, PositionStatus, Quote, TradingAccount,
    User,
};

// Re-export main functionality
pub use account::{AccountStore, FileStore, KeyValueStore, MemoryStore, TradePermission};
pub use config::SimConfig;
pub use engine::{advance, PositionEngine, Settlement, TradeRequest};
pub use feed::{PriceFeed, PriceSource};
pub use simulation::{Simulation, TickReport};

/// Error types for forex-sim-core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("{0}")]
    Validation(String),

    #[error("An account with this email already exists")]
    DuplicateEmail,

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Not logged in")]
    NotAuthenticated,

    #[error("{0}")]
    TradeRejected(String),

    #[error("Insufficient free margin. Need ${needed:.2}, have ${available:.2}")]
    InsufficientMargin { needed: f64, available: f64 },

    #[error("Unknown pair: {0}")]
    UnknownPair(String),
}

/// Result type for forex-sim-core operations.
pub type Result<T> = std::result::Result<T, Error>;
