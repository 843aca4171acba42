//! Simulation driver.
//!
//! Owns the account store, the position engine and the price feed for one
//! session. A tick is SL/TP evaluation against the current quotes followed by
//! a feed update; it runs to completion before the next one starts.

use crate::account::{AccountStore, KeyValueStore, SignupRequest};
use crate::config::SimConfig;
use crate::engine::{EngineSettings, PositionEngine, Settlement, TradeRequest};
use crate::feed::{PriceFeed, PriceSource};
use crate::types::{Plan, Position, Quote, TradingAccount, User};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

const QUOTES_KEY: &str = "forex_sim_quotes";

/// What one tick did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickReport {
    pub at: DateTime<Utc>,
    /// Daily trade counter was reset on this tick
    pub daily_reset: bool,
    pub settlements: Vec<Settlement>,
    /// Account after settlement, absent without a session
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<TradingAccount>,
}

pub struct Simulation<S: KeyValueStore> {
    accounts: AccountStore<S>,
    engine: PositionEngine,
    feed: PriceFeed,
    config: SimConfig,
}

impl<S: KeyValueStore> Simulation<S> {
    /// Open a simulation over `store`, resuming the persisted session, book
    /// and last quotes.
    pub fn open(store: S, config: SimConfig) -> Result<Self> {
        let accounts = AccountStore::open(store, &config)?;
        let feed = match accounts.backend().get_json::<Vec<Quote>>(QUOTES_KEY)? {
            Some(quotes) if !quotes.is_empty() => PriceFeed::from_quotes(quotes, config.max_tick_move),
            _ => PriceFeed::new(config.max_tick_move),
        };
        Self::with_parts(accounts, feed, config)
    }

    /// Assemble from explicit parts, e.g. a feed with custom pairs.
    pub fn with_parts(accounts: AccountStore<S>, feed: PriceFeed, config: SimConfig) -> Result<Self> {
        let mut simulation = Self {
            accounts,
            engine: PositionEngine::new(EngineSettings::from(&config)),
            feed,
            config,
        };
        simulation.load_book()?;
        Ok(simulation)
    }

    pub fn accounts(&self) -> &AccountStore<S> {
        &self.accounts
    }

    pub fn engine(&self) -> &PositionEngine {
        &self.engine
    }

    pub fn feed(&self) -> &PriceFeed {
        &self.feed
    }

    pub fn feed_mut(&mut self) -> &mut PriceFeed {
        &mut self.feed
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    fn load_book(&mut self) -> Result<()> {
        let positions = if self.accounts.is_authenticated() {
            self.accounts.load_positions(None)?
        } else {
            Vec::new()
        };
        debug!("Loaded {} positions", positions.len());
        self.engine.replace_positions(positions);
        Ok(())
    }

    fn save_quotes(&mut self) -> Result<()> {
        self.accounts
            .backend_mut()
            .set_json(QUOTES_KEY, &self.feed.quotes())
    }

    fn persist(&mut self, account: &TradingAccount) -> Result<()> {
        self.accounts.save_trading_account(account, None)?;
        self.accounts.save_positions(self.engine.positions(), None)
    }

    pub fn signup(&mut self, request: &SignupRequest) -> Result<User> {
        let user = self.accounts.signup(request)?;
        self.load_book()?;
        Ok(user)
    }

    pub fn login(&mut self, email: &str, password: &str) -> Result<User> {
        let user = self.accounts.login(email, password)?;
        self.load_book()?;
        Ok(user)
    }

    pub fn logout(&mut self) -> Result<()> {
        self.accounts.logout()?;
        self.engine.replace_positions(Vec::new());
        Ok(())
    }

    pub fn upgrade_plan(&mut self, plan: Plan) -> Result<User> {
        self.accounts.upgrade_plan(plan)
    }

    pub fn trades_remaining(&mut self) -> Result<Option<u32>> {
        self.accounts.trades_remaining()
    }

    /// Session account reconciled against the current book.
    pub fn account(&mut self) -> Result<TradingAccount> {
        let mut account = self.accounts.trading_account(None)?;
        self.engine.reconcile(&mut account);
        Ok(account)
    }

    fn price_for(&self, pair: &str) -> Result<f64> {
        self.feed
            .price(pair)
            .ok_or_else(|| Error::UnknownPair(pair.to_uppercase()))
    }

    /// Open a position at the current quote.
    ///
    /// The daily counter is settled against `now` before the plan check, and
    /// the counted trade is saved in the same account write as the new margin.
    pub fn execute_trade(&mut self, request: &TradeRequest, now: DateTime<Utc>) -> Result<Position> {
        if !self.accounts.is_authenticated() {
            return Err(Error::NotAuthenticated);
        }
        let price = self.price_for(&request.pair)?;
        self.accounts.settle(now)?;
        let permission = self.accounts.can_make_trade()?;
        let mut account = self.account()?;

        let position =
            self.engine
                .execute_trade(request, price, &permission, &mut account, now)?;
        account.count_trade();

        self.persist(&account)?;
        Ok(position)
    }

    /// Close a position at the current quote. `None` when it is not open.
    pub fn close_trade(&mut self, id: &str, now: DateTime<Utc>) -> Result<Option<Settlement>> {
        let Some(pair) = self
            .engine
            .position(id)
            .filter(|p| p.is_open())
            .map(|p| p.pair.clone())
        else {
            return Ok(None);
        };

        let price = self.price_for(&pair)?;
        let mut account = self.account()?;
        let settlement = self.engine.close_trade(id, price, &mut account, now);
        if settlement.is_some() {
            self.persist(&account)?;
        }
        Ok(settlement)
    }

    /// Replace SL/TP on an open position. `None` when it is not open.
    pub fn modify_trade(
        &mut self,
        id: &str,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Result<Option<Position>> {
        let modified = self
            .engine
            .modify_trade(id, stop_loss, take_profit)
            .cloned();
        if modified.is_some() {
            self.accounts.save_positions(self.engine.positions(), None)?;
        }
        Ok(modified)
    }

    /// Run one tick.
    pub fn step<R: Rng>(&mut self, rng: &mut R, now: DateTime<Utc>) -> Result<TickReport> {
        if !self.accounts.is_authenticated() {
            self.feed.tick(rng, now);
            self.save_quotes()?;
            return Ok(TickReport {
                at: now,
                daily_reset: false,
                settlements: Vec::new(),
                account: None,
            });
        }

        let daily_reset = self.accounts.settle(now)?;

        let mut account = self.accounts.trading_account(None)?;
        let settlements = self.engine.evaluate(&mut account, &self.feed, now);

        self.feed.tick(rng, now);
        self.save_quotes()?;
        self.persist(&account)?;

        if !settlements.is_empty() {
            info!("Tick closed {} positions", settlements.len());
        }

        Ok(TickReport {
            at: now,
            daily_reset,
            settlements,
            account: Some(account),
        })
    }

    /// Tick on a fixed timer until `max_ticks` is reached or Ctrl-C.
    ///
    /// Returns the number of ticks run.
    pub async fn run(&mut self, max_ticks: Option<u64>) -> Result<u64> {
        self.run_with(max_ticks, |_| {}).await
    }

    /// Like [`Simulation::run`], handing each report to `on_tick`.
    pub async fn run_with<F>(&mut self, max_ticks: Option<u64>, mut on_tick: F) -> Result<u64>
    where
        F: FnMut(&TickReport),
    {
        let period = Duration::from_millis(self.config.tick_interval_ms);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut rng = StdRng::from_entropy();
        let mut ticks = 0;

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        info!("Simulation running, tick every {:?}", period);
        while max_ticks.map_or(true, |max| ticks < max) {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.step(&mut rng, Utc::now())?;
                    on_tick(&report);
                    ticks += 1;
                }
                _ = &mut shutdown => {
                    info!("Interrupted after {} ticks", ticks);
                    break;
                }
            }
        }

        Ok(ticks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::MemoryStore;
    use crate::types::{CloseReason, Direction};
    use approx::assert_abs_diff_eq;

    fn config() -> SimConfig {
        SimConfig {
            tick_interval_ms: 1,
            ..Default::default()
        }
    }

    fn signed_up() -> Simulation<MemoryStore> {
        let mut sim = Simulation::open(MemoryStore::new(), config()).unwrap();
        sim.signup(&SignupRequest::new(
            "Grace",
            "Hopper",
            "grace@example.com",
            "cobol1",
            "cobol1",
        ))
        .unwrap();
        sim
    }

    #[test]
    fn test_trade_requires_session() {
        let mut sim = Simulation::open(MemoryStore::new(), config()).unwrap();
        let request = TradeRequest::new("EUR/USD", Direction::Buy, 1.0);
        assert!(matches!(
            sim.execute_trade(&request, Utc::now()),
            Err(Error::NotAuthenticated)
        ));
    }

    #[test]
    fn test_unknown_pair() {
        let mut sim = signed_up();
        let request = TradeRequest::new("XAU/USD", Direction::Buy, 1.0);
        assert!(matches!(
            sim.execute_trade(&request, Utc::now()),
            Err(Error::UnknownPair(_))
        ));
        assert_eq!(sim.account().unwrap().trades_count, 0);
    }

    #[test]
    fn test_execute_trade_records_and_persists() {
        let mut sim = signed_up();
        let request = TradeRequest::new("EUR/USD", Direction::Buy, 1.5);
        let position = sim.execute_trade(&request, Utc::now()).unwrap();

        let account = sim.account().unwrap();
        assert_eq!(account.trades_count, 1);
        assert_eq!(account.daily_trades_used, 1);
        assert_eq!(account.margin, 1_500.0);
        assert_eq!(account.free_margin, 98_500.0);

        let stored = sim.accounts().load_positions(None).unwrap();
        assert_eq!(stored, vec![position]);
    }

    #[test]
    fn test_new_day_trade_resets_counter_without_tick() {
        let mut sim = signed_up();
        let request = TradeRequest::new("EUR/USD", Direction::Buy, 0.01);
        for _ in 0..50 {
            sim.execute_trade(&request, Utc::now()).unwrap();
        }
        assert!(matches!(
            sim.execute_trade(&request, Utc::now()),
            Err(Error::TradeRejected(_))
        ));

        let tomorrow = Utc::now() + chrono::Duration::days(1);
        sim.execute_trade(&request, tomorrow).unwrap();

        let account = sim.account().unwrap();
        assert_eq!(account.daily_trades_used, 1);
        assert_eq!(account.trades_count, 51);
        assert_eq!(account.last_trade_reset, tomorrow);
    }

    /// Memory store that counts trading account writes.
    #[derive(Debug, Default, Clone)]
    struct CountingStore {
        inner: MemoryStore,
        account_writes: usize,
    }

    impl KeyValueStore for CountingStore {
        fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key)
        }

        fn set(&mut self, key: &str, value: &str) -> Result<()> {
            if key.starts_with("forex_sim_account_") {
                self.account_writes += 1;
            }
            self.inner.set(key, value)
        }

        fn remove(&mut self, key: &str) -> Result<()> {
            self.inner.remove(key)
        }
    }

    #[test]
    fn test_trade_counted_in_single_account_write() {
        let mut sim = Simulation::open(CountingStore::default(), config()).unwrap();
        sim.signup(&SignupRequest::new(
            "Grace",
            "Hopper",
            "grace@example.com",
            "cobol1",
            "cobol1",
        ))
        .unwrap();
        let writes = sim.accounts().backend().account_writes;

        let request = TradeRequest::new("EUR/USD", Direction::Buy, 1.0);
        sim.execute_trade(&request, Utc::now()).unwrap();
        assert_eq!(sim.accounts().backend().account_writes, writes + 1);

        let user_id = sim.accounts().current_user().unwrap().id.clone();
        let stored: TradingAccount = sim
            .accounts()
            .backend()
            .get_json(&format!("forex_sim_account_{}", user_id))
            .unwrap()
            .unwrap();
        assert_eq!(stored.trades_count, 1);
        assert_eq!(stored.daily_trades_used, 1);
        assert_eq!(stored.margin, 1_000.0);
        assert_eq!(stored.free_margin, 99_000.0);
    }

    #[test]
    fn test_step_settles_take_profit() {
        let mut sim = signed_up();
        let request = TradeRequest::new("EUR/USD", Direction::Buy, 1.0).with_take_profit(1.0860);
        let position = sim.execute_trade(&request, Utc::now()).unwrap();

        sim.feed_mut()
            .set_price("EUR/USD", 1.0861, Utc::now())
            .unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let report = sim.step(&mut rng, Utc::now()).unwrap();

        assert_eq!(report.settlements.len(), 1);
        assert_eq!(report.settlements[0].position_id, position.id);
        assert_eq!(report.settlements[0].reason, CloseReason::TakeProfit);

        let account = report.account.unwrap();
        assert_abs_diff_eq!(account.balance, 100_110.0, epsilon = 1e-6);
        assert_eq!(account.margin, 0.0);
        assert_eq!(sim.account().unwrap(), account);
    }

    #[test]
    fn test_step_without_session_only_moves_prices() {
        let mut sim = Simulation::open(MemoryStore::new(), config()).unwrap();
        let before = sim.feed().prices();
        let report = sim.step(&mut StdRng::seed_from_u64(9), Utc::now()).unwrap();

        assert!(report.account.is_none());
        assert_ne!(before, sim.feed().prices());
    }

    #[test]
    fn test_close_and_modify_noops() {
        let mut sim = signed_up();
        assert!(sim.close_trade("missing", Utc::now()).unwrap().is_none());
        assert!(sim.modify_trade("missing", Some(1.0), None).unwrap().is_none());
    }

    #[test]
    fn test_book_survives_relogin() {
        let mut sim = signed_up();
        let request = TradeRequest::new("GBP/USD", Direction::Sell, 1.0);
        let position = sim.execute_trade(&request, Utc::now()).unwrap();

        sim.logout().unwrap();
        assert!(sim.engine().positions().is_empty());

        sim.login("grace@example.com", "cobol1").unwrap();
        assert_eq!(sim.engine().positions(), &[position]);
        assert_eq!(sim.account().unwrap().margin, 1_000.0);
    }

    #[test]
    fn test_quotes_resume_after_reopen() {
        let mut sim = signed_up();
        sim.step(&mut StdRng::seed_from_u64(5), Utc::now()).unwrap();
        let prices = sim.feed().prices();

        let backend = sim.accounts().backend().clone();
        let reopened = Simulation::open(backend, config()).unwrap();
        assert_eq!(reopened.feed().prices(), prices);
        assert!(reopened.accounts().is_authenticated());
    }

    #[tokio::test]
    async fn test_run_stops_after_max_ticks() {
        let mut sim = signed_up();
        let mut seen = 0;
        let ticks = sim.run_with(Some(3), |_| seen += 1).await.unwrap();
        assert_eq!(ticks, 3);
        assert_eq!(seen, 3);
    }
}
