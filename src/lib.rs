//! # durastore
//!
//! Resilient data access and state persistence over SQLite.
//!
//! Three cooperating layers: a supervised connection pool with health
//! checking, leak detection and replica failover; a generic audited
//! repository with unit-of-work transactions; and a debounced
//! persistence engine that batches high-frequency widget-state writes.
//!
//! ## Architecture
//!
//! ```text
//! Application code
//!     │
//!     ├── Repository<T> / UnitOfWork (repository/)
//!     │       └── audit trail, soft delete, bulk ops, cache
//!     ├── PersistenceEngine (persistence/)
//!     │       └── debounce, batching, conflict resolution
//!     │
//!     └── ConnectionManager (pool/)
//!             ├── health monitor + leak detector
//!             ├── failover targets
//!             └── sqlx::SqlitePool
//! ```

pub mod config;
pub mod error;
pub mod persistence;
pub mod pool;
pub mod repository;
pub mod schema;

pub use config::StoreConfig;
pub use error::StoreError;
pub use persistence::PersistenceEngine;
pub use pool::ConnectionManager;
pub use repository::{Entity, Repository, UnitOfWork};
