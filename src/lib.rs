//! `openclaw_state` — pluggable key-value state store for a long-running
//! process that keeps small JSON documents (auth profiles, sandbox
//! registries, cron jobs, pairing handshakes, offsets, restart sentinels).
//!
//! Two backends share one contract ([`backend::StateBackend`]): a
//! filesystem backend (one JSON file per key under a per-user state
//! directory) and a database backend (a single `kv` table served through a
//! write-through in-memory cache). [`selector::init`] resolves which one is
//! live from `OPENCLAW_DATASTORE`, runs whichever direction of
//! [`migrate`] that implies, and installs the process-wide instance
//! returned by [`selector::get`].
//!
//! Call sites never construct a backend directly — they call
//! [`selector::init`] once at startup, then [`selector::get`] for every
//! read/write/update, and [`selector::flush`] before any externally
//! observable commit point that depends on durability.

pub mod backend;
pub mod data_dir;
pub mod error;
pub mod key;
pub mod lock;
pub mod migrate;
pub mod selector;
pub mod store;

pub use backend::{FallbackRead, StateBackend, UpdateOutcome};
pub use error::{Result, StateError};
