//! Factbase – a small fact-based database with declared attributes and a
//! datalog query language.
//!
//! Everything stored is a *fact* `[entity attribute value tx]`:
//! * An entity is an opaque [`construct::Thing`] (a simple `u64`).
//! * An [`construct::Attribute`] must be declared before use, with a value
//!   type and a cardinality. Attributes are entities themselves, described
//!   by facts on the reserved `:db/*` attributes.
//! * Every committed batch is a transaction entity carrying `:db/txInstant`.
//!
//! Facts are owned and deduplicated by keepers (see the `construct` module),
//! which maintain the indexes queries are evaluated against.
//!
//! ## Modules
//! * [`construct`] – things, attributes, facts, their keepers and the [`construct::Database`].
//! * [`datatype`] – value types, cardinalities, values and untyped data.
//! * [`transact`] – validation and planning of insertion batches and schema declarations.
//! * [`query`] – pattern queries, predicates and pull.
//! * [`datalog`] – the script language (parser + engine).
//! * [`persist`] – SQLite persistence and the transaction ledger.
//! * [`catalog`] – databases by connection uri.
//! * [`interface`], [`server`], [`config`] – running scripts in the background and over HTTP.
//!
//! ## Quick Start
//! ```
//! use factbase::{construct::{Database, PersistenceMode}, datalog::Engine};
//! let db = Database::new(PersistenceMode::InMemory).unwrap();
//! let engine = Engine::new(&db);
//! engine.execute(r#"
//!     [{:db/ident :user/email :db/valueType :db.type/string}]
//!     [{:user/email "sally@example.com"}]
//! "#).unwrap();
//! let result = engine
//!     .execute_collect("[:find ?email :where [_ :user/email ?email]]")
//!     .unwrap()
//!     .unwrap();
//! assert_eq!(result.row_count, 1);
//! ```

pub mod catalog;
pub mod config;
pub mod construct;
pub mod datalog;
pub mod datatype;
pub mod error;
pub mod interface;
pub mod persist;
pub mod query;
pub mod server;
pub mod transact;

pub use construct::{Database, PersistenceMode, Thing};
pub use error::{FactbaseError, Result};
