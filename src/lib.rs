//! Session coordination core for collaborative pointing sessions.
//!
//! Three pieces cooperate through one shared [`kv::KvStore`]:
//!
//! - [`lock`]: lease-based mutual exclusion across processes
//! - [`session`]: the multi-row session aggregate, written transactionally
//! - [`notify`]: watcher bookkeeping and change fan-out to live connections
//!
//! [`ops`] layers the user-facing operations (join, vote, reveal, ...) on
//! top of them.

pub mod config;
pub mod context;
pub mod dispatch;
pub mod kv;
pub mod lock;
pub mod notify;
pub mod ops;
pub mod session;
pub mod stats;
pub mod telemetry;

pub use config::{ConfigError, CoreConfig};
pub use context::CallContext;
pub use dispatch::{DeliveryError, Message, MessageDispatcher, MessageType};
pub use kv::{KvStore, MemoryStore, StoreError};
pub use lock::{session_lock_key, LockError, LockGuard, LockManager};
pub use notify::{DisconnectReport, Notifier, NotifyError, NotifyReport};
pub use ops::{OpsError, SessionOps, UpdateRequest};
pub use session::{SessionAggregate, SessionError, SessionStore, SessionView, User, UserRole};
pub use stats::{Principal, StatsUpdateFactory};
