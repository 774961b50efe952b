//! Debounced widget-state persistence.
//!
//! UI widget values arrive at keystroke rate; the [`PersistenceEngine`]
//! coalesces them in memory and writes only the latest value per
//! `(session, key)` once a debounce window elapses, a batch fills, or a
//! flush is forced. Recovery reads a session's rows back for rehydration.

mod conflict;
mod engine;
mod models;

pub use conflict::{ConflictStrategy, MergePolicy, resolve};
pub use engine::{FlushReport, PersistenceEngine};
pub use models::WidgetStateRecord;
