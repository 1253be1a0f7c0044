//! envgrid-state — environment documents and their embedded store.
//!
//! Backed by [redb](https://docs.rs/redb). An environment is stored as a
//! set of documents sharing the `{project}/{name}` key:
//!
//! - the environment header (namespace, status, default values, revision)
//! - one document per service group (`{project}/{name}#{group}`)
//! - the global variable set
//! - the deploy strategy map
//!
//! Writes that must land together go through [`EnvTransaction`], a redb
//! write transaction spanning all four tables. Dropping it without
//! `commit()` discards every staged write.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{EnvTransaction, StateStore};
pub use types::*;
