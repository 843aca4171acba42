//! Demo identities and trading account bookkeeping.
//!
//! Records live in a [`KeyValueStore`]; the session is an explicit value held
//! by [`AccountStore`] and mirrored to a marker record so a reopened store
//! resumes it.

mod storage;
mod store;
mod validation;

pub use storage::{FileStore, KeyValueStore, MemoryStore};
pub use store::{AccountStore, Session, TradePermission};
pub use validation::{is_valid_email, normalize_email, password_digest, SignupRequest};
