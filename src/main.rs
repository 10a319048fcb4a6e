//! The factbase server.
//!
//! Opens the configured database, runs the optional startup script and
//! serves datalog scripts over HTTP:
//!
//! ```text
//! curl -X POST localhost:8080/v1/execute \
//!      -H 'content-type: application/json' \
//!      -d '{"script": "[:find ?e :where [?e :user/email _]]"}'
//! ```

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use factbase::catalog;
use factbase::config::Settings;
use factbase::error::{FactbaseError, Result};
use factbase::interface::ScriptInterface;
use factbase::server;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!(error = %e, "factbase stopped");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let settings = Settings::load()?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let database = catalog::connect(&settings.database)?;
    let interface = Arc::new(ScriptInterface::new(database));
    if let Some(path) = &settings.startup_script {
        let script = std::fs::read_to_string(path).map_err(|e| {
            FactbaseError::Config(format!("cannot read startup script {}: {}", path, e))
        })?;
        let outcomes = interface.run_sync(&script)?;
        info!(path = %path, outcomes = outcomes.len(), "startup script done");
    }

    let listener = tokio::net::TcpListener::bind(&settings.listen)
        .await
        .map_err(|e| {
            FactbaseError::Config(format!("cannot listen on {}: {}", settings.listen, e))
        })?;
    info!(listen = %settings.listen, database = %settings.database, "serving");
    axum::serve(listener, server::router(interface))
        .await
        .map_err(|e| FactbaseError::Execution(e.to_string()))
}
