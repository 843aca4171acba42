//! Users, session and trading account bookkeeping.

use super::storage::KeyValueStore;
use super::validation::{normalize_email, password_digest, SignupRequest};
use crate::config::SimConfig;
use crate::types::{Plan, Position, TradingAccount, User};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const USERS_KEY: &str = "forex_sim_users";
const SESSION_KEY: &str = "forex_sim_current_user";

fn account_key(user_id: &str) -> String {
    format!("forex_sim_account_{}", user_id)
}

fn positions_key(user_id: &str) -> String {
    format!("forex_sim_positions_{}", user_id)
}

/// The logged-in user for this store.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub user: User,
    pub started_at: DateTime<Utc>,
}

/// Outcome of the trade policy check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradePermission {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TradePermission {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            message: None,
        }
    }

    pub fn denied(message: impl Into<String>) -> Self {
        Self {
            allowed: false,
            message: Some(message.into()),
        }
    }
}

/// Account store over a swappable storage backend.
#[derive(Debug)]
pub struct AccountStore<S: KeyValueStore> {
    store: S,
    session: Option<Session>,
    starting_balance: f64,
    daily_trade_limit: u32,
}

impl<S: KeyValueStore> AccountStore<S> {
    /// Open the store, restoring a persisted session and settling its daily counter.
    pub fn open(store: S, config: &SimConfig) -> Result<Self> {
        let mut accounts = Self {
            store,
            session: None,
            starting_balance: config.starting_balance,
            daily_trade_limit: config.daily_trade_limit,
        };

        if let Some(user_id) = accounts.store.get_json::<String>(SESSION_KEY)? {
            match accounts.find_user_by_id(&user_id)? {
                Some(user) => {
                    debug!("Restored session for {}", user.email);
                    accounts.session = Some(Session {
                        user,
                        started_at: Utc::now(),
                    });
                    accounts.settle(Utc::now())?;
                }
                None => {
                    warn!("Session marker points at unknown user {}, clearing", user_id);
                    accounts.store.remove(SESSION_KEY)?;
                }
            }
        }

        Ok(accounts)
    }

    /// Underlying storage backend.
    pub fn backend(&self) -> &S {
        &self.store
    }

    pub fn backend_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn daily_trade_limit(&self) -> u32 {
        self.daily_trade_limit
    }

    /// All registered users.
    pub fn users(&self) -> Result<Vec<User>> {
        Ok(self.store.get_json(USERS_KEY)?.unwrap_or_default())
    }

    fn save_users(&mut self, users: &[User]) -> Result<()> {
        self.store.set_json(USERS_KEY, &users)
    }

    fn find_user_by_id(&self, user_id: &str) -> Result<Option<User>> {
        Ok(self.users()?.into_iter().find(|u| u.id == user_id))
    }

    fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let email = normalize_email(email);
        Ok(self.users()?.into_iter().find(|u| u.email == email))
    }

    fn start_session(&mut self, user: User) -> Result<()> {
        self.store.set_json(SESSION_KEY, &user.id)?;
        self.session = Some(Session {
            user,
            started_at: Utc::now(),
        });
        Ok(())
    }

    /// Register a new free-plan user with a fresh account and log them in.
    pub fn signup(&mut self, request: &SignupRequest) -> Result<User> {
        request.validate()?;

        if self.find_user_by_email(&request.email)?.is_some() {
            warn!("Signup rejected, email already registered");
            return Err(Error::DuplicateEmail);
        }

        let now = Utc::now();
        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            first_name: request.first_name.trim().to_string(),
            last_name: request.last_name.trim().to_string(),
            email: normalize_email(&request.email),
            plan: Plan::Free,
            created_at: now,
            password_digest: password_digest(&request.email, &request.password),
        };

        let mut users = self.users()?;
        users.push(user.clone());
        self.save_users(&users)?;

        let account = TradingAccount::new(self.starting_balance, now);
        self.store.set_json(&account_key(&user.id), &account)?;

        self.start_session(user.clone())?;
        info!("Signed up {} ({})", user.email, user.id);
        Ok(user)
    }

    /// Log in with email and password.
    pub fn login(&mut self, email: &str, password: &str) -> Result<User> {
        let user = self
            .find_user_by_email(email)?
            .filter(|u| u.password_digest == password_digest(email, password))
            .ok_or_else(|| {
                warn!("Failed login attempt");
                Error::InvalidCredentials
            })?;

        self.start_session(user.clone())?;
        self.settle(Utc::now())?;
        info!("Logged in {}", user.email);
        Ok(user)
    }

    /// Clear the session. User and account records stay.
    pub fn logout(&mut self) -> Result<()> {
        if let Some(session) = self.session.take() {
            info!("Logged out {}", session.user.email);
        }
        self.store.remove(SESSION_KEY)
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn current_user(&self) -> Option<&User> {
        self.session.as_ref().map(|s| &s.user)
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.is_some()
    }

    fn resolve_user_id(&self, user_id: Option<&str>) -> Result<String> {
        match user_id {
            Some(id) => Ok(id.to_string()),
            None => self
                .current_user()
                .map(|u| u.id.clone())
                .ok_or(Error::NotAuthenticated),
        }
    }

    /// Account for `user_id` (or the session user). A missing record is
    /// created with the starting balance.
    pub fn trading_account(&mut self, user_id: Option<&str>) -> Result<TradingAccount> {
        let user_id = self.resolve_user_id(user_id)?;
        let key = account_key(&user_id);

        match self.store.get_json::<TradingAccount>(&key)? {
            Some(account) => Ok(account),
            None => {
                debug!("Creating default trading account for {}", user_id);
                let account = TradingAccount::new(self.starting_balance, Utc::now());
                self.store.set_json(&key, &account)?;
                Ok(account)
            }
        }
    }

    /// Overwrite the persisted account.
    pub fn save_trading_account(
        &mut self,
        account: &TradingAccount,
        user_id: Option<&str>,
    ) -> Result<()> {
        let user_id = self.resolve_user_id(user_id)?;
        self.store.set_json(&account_key(&user_id), account)
    }

    /// Reset the daily trade counter when `now` falls on a later calendar day.
    ///
    /// Returns whether a reset happened. Does nothing without a session.
    pub fn settle(&mut self, now: DateTime<Utc>) -> Result<bool> {
        if !self.is_authenticated() {
            return Ok(false);
        }

        let mut account = self.trading_account(None)?;
        if !account.needs_daily_reset(now) {
            return Ok(false);
        }

        debug!(
            "Daily trade counter reset ({} used on {})",
            account.daily_trades_used,
            account.last_trade_reset.date_naive()
        );
        account.daily_trades_used = 0;
        account.last_trade_reset = now;
        self.save_trading_account(&account, None)?;
        Ok(true)
    }

    /// Plan policy: elite is unlimited, free is capped per calendar day.
    pub fn can_make_trade(&mut self) -> Result<TradePermission> {
        let Some(plan) = self.current_user().map(|u| u.plan) else {
            return Ok(TradePermission::denied("Please log in to trade"));
        };

        if plan == Plan::Elite {
            return Ok(TradePermission::allowed());
        }

        let account = self.trading_account(None)?;
        if account.daily_trades_used >= self.daily_trade_limit {
            return Ok(TradePermission::denied(format!(
                "Daily trade limit reached ({} trades). Upgrade to Elite for unlimited trading.",
                self.daily_trade_limit
            )));
        }

        Ok(TradePermission::allowed())
    }

    /// Trades left today, `None` when unlimited.
    pub fn trades_remaining(&mut self) -> Result<Option<u32>> {
        let plan = self
            .current_user()
            .map(|u| u.plan)
            .ok_or(Error::NotAuthenticated)?;
        if plan == Plan::Elite {
            return Ok(None);
        }
        let account = self.trading_account(None)?;
        Ok(Some(
            self.daily_trade_limit
                .saturating_sub(account.daily_trades_used),
        ))
    }

    /// Count one executed trade against the session user's account.
    pub fn record_trade(&mut self) -> Result<TradingAccount> {
        let mut account = self.trading_account(None)?;
        account.count_trade();
        self.save_trading_account(&account, None)?;
        Ok(account)
    }

    /// Switch the session user's plan.
    pub fn upgrade_plan(&mut self, plan: Plan) -> Result<User> {
        let user_id = self.resolve_user_id(None)?;
        let mut users = self.users()?;
        let user = users
            .iter_mut()
            .find(|u| u.id == user_id)
            .ok_or(Error::NotAuthenticated)?;
        user.plan = plan;
        let updated = user.clone();
        self.save_users(&users)?;

        if let Some(session) = self.session.as_mut() {
            session.user = updated.clone();
        }
        info!("Plan for {} set to {}", updated.email, plan);
        Ok(updated)
    }

    /// Position book persisted for `user_id` (or the session user).
    pub fn load_positions(&self, user_id: Option<&str>) -> Result<Vec<Position>> {
        let user_id = self.resolve_user_id(user_id)?;
        Ok(self
            .store
            .get_json(&positions_key(&user_id))?
            .unwrap_or_default())
    }

    pub fn save_positions(&mut self, positions: &[Position], user_id: Option<&str>) -> Result<()> {
        let user_id = self.resolve_user_id(user_id)?;
        self.store.set_json(&positions_key(&user_id), &positions)
    }
}
