//! tributary-pg
//!
//! PostgreSQL `Sink` for tributary. Rows go into a pre-existing table; no
//! migrations are run:
//!
//! ```sql
//! CREATE TABLE entries (
//!     idempotency_key TEXT PRIMARY KEY,
//!     subject         TEXT NOT NULL,
//!     payload         BYTEA NOT NULL,
//!     timestamp       TIMESTAMPTZ NOT NULL
//! );
//! ```

mod sink;

pub use sink::{PgSinkError, PostgresSink};
