//! Persistence layer.
//!
//! Two stores with different jobs:
//!
//! - [`StateStore`]: a keyed JSON document store holding each coordinator's
//!   owned state. One `save` call is one transaction; the runtime guarantees
//!   a single writer per key, so the store needs no further coordination.
//!   This is the source of truth.
//! - [`IndexStore`]: a tabular SQLite mirror (spans, tenants, agreements,
//!   rooms, documents, audit) written best-effort from multiple
//!   coordinators. Duplicate inserts must be tolerated idempotently; the
//!   core never reads it to serve hot-window traffic.

mod index;
mod state;

pub use index::{IndexError, IndexStore, SpanRow};
pub use state::{MemoryStateStore, SqliteStateStore, StateStore, StateStoreError};
