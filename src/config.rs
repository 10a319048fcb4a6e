//! Settings for the factbase server.
//!
//! Read in order of increasing precedence: built-in defaults, an optional
//! `factbase.{toml,json,yaml}` file in the working directory, and
//! environment variables prefixed with `FACTBASE_` (for example
//! `FACTBASE_LISTEN=0.0.0.0:9000`).

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    /// Connection uri, see the catalog module.
    pub database: String,
    pub listen: String,
    /// A script run once the database is open, typically the schema.
    pub startup_script: Option<String>,
    /// Filter directives for the log, used when `RUST_LOG` is not set.
    pub log_filter: String,
}

impl Settings {
    pub fn load() -> Result<Settings> {
        Self::load_from("factbase")
    }

    pub fn load_from(file: &str) -> Result<Settings> {
        let settings = Config::builder()
            .set_default("database", "factbase:sqlite://factbase.db")?
            .set_default("listen", "127.0.0.1:8080")?
            .set_default("log_filter", "factbase=info")?
            .add_source(File::with_name(file).required(false))
            .add_source(Environment::with_prefix("FACTBASE"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}
