//! Named databases behind connection URIs.
//!
//! `factbase:mem://name` opens (or creates) an in-memory database that lives
//! as long as the process and is shared by everyone connecting to the same
//! name. `factbase:sqlite://path` opens a database backed by a SQLite file.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;
use regex::Regex;
use tracing::info;

use crate::construct::{Database, PersistenceMode};
use crate::error::{FactbaseError, Result};

lazy_static! {
    static ref URI: Regex = Regex::new(r"^factbase:(mem|sqlite)://(.+)$").unwrap();
    static ref CATALOG: Mutex<HashMap<String, Arc<Database>>> = Mutex::new(HashMap::new());
}

fn mode_of(uri: &str) -> Result<PersistenceMode> {
    let captures = URI
        .captures(uri)
        .ok_or_else(|| FactbaseError::Config(format!("unsupported database uri '{}'", uri)))?;
    Ok(match &captures[1] {
        "mem" => PersistenceMode::InMemory,
        _ => PersistenceMode::File(captures[2].to_string()),
    })
}

/// Connects to the database named by the uri, creating it when needed.
/// Connecting twice to the same uri gives the same database.
pub fn connect(uri: &str) -> Result<Arc<Database>> {
    let mode = mode_of(uri)?;
    let mut catalog = CATALOG.lock()?;
    if let Some(database) = catalog.get(uri) {
        return Ok(Arc::clone(database));
    }
    let database = Arc::new(Database::new(mode)?);
    catalog.insert(uri.to_string(), Arc::clone(&database));
    info!(uri, "connected");
    Ok(database)
}

/// Creates the database named by the uri. Returns false if it was already
/// open in this process.
pub fn create_database(uri: &str) -> Result<bool> {
    let existed = CATALOG.lock()?.contains_key(uri);
    connect(uri)?;
    Ok(!existed)
}

/// Forgets the database named by the uri. Connections already handed out
/// keep working; a file-backed database keeps its file.
pub fn delete_database(uri: &str) -> Result<bool> {
    mode_of(uri)?;
    let removed = CATALOG.lock()?.remove(uri).is_some();
    if removed {
        info!(uri, "deleted");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_uri_same_database() {
        let first = connect("factbase:mem://catalog-same").unwrap();
        let second = connect("factbase:mem://catalog-same").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn deleted_database_starts_over() {
        let uri = "factbase:mem://catalog-deleted";
        assert!(create_database(uri).unwrap());
        assert!(!create_database(uri).unwrap());
        let before = connect(uri).unwrap();
        assert!(delete_database(uri).unwrap());
        assert!(!delete_database(uri).unwrap());
        let after = connect(uri).unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn unknown_scheme_is_a_config_error() {
        let err = connect("postgres://localhost/db").unwrap_err();
        assert!(matches!(err, FactbaseError::Config(_)));
    }
}
