//! Threaded interface for submitting and controlling datalog scripts.
//!
//! Each submitted script runs on its own background thread and streams its
//! outcomes back over a channel as they are produced. Cancellation is
//! cooperative through an `Arc<AtomicBool>` that is checked between
//! commands.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::construct::Database;
use crate::datalog::{Engine, Outcome};
use crate::error::{FactbaseError, Result};

/// Cancellation token shared with the worker thread.
#[derive(Debug, Clone)]
pub struct CancelToken(Arc<AtomicBool>);
impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Opaque script identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScriptId(u64);

/// Handle to a running or completed script.
pub struct ScriptHandle {
    pub id: ScriptId,
    cancel: CancelToken,
    started: Instant,
    join: Option<JoinHandle<Result<usize>>>,
    pub outcomes: Receiver<Outcome>,
}
impl ScriptHandle {
    /// Request cancellation. Commands already running finish first.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
    /// Waits for the script to finish and returns how many commands ran.
    pub fn join(mut self) -> Result<usize> {
        match self.join.take() {
            Some(join) => join
                .join()
                .map_err(|_| FactbaseError::Execution("script thread panicked".into()))?,
            None => Ok(0),
        }
    }
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Registry managing script lifecycles against one database.
pub struct ScriptInterface {
    db: Arc<Database>,
    next_id: Mutex<u64>,
    active: Arc<Mutex<HashMap<ScriptId, CancelToken>>>,
}

impl ScriptInterface {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            next_id: Mutex::new(0),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn allocate_id(&self) -> Result<ScriptId> {
        let mut next = self.next_id.lock()?;
        *next += 1;
        Ok(ScriptId(*next))
    }

    /// Runs a script on a background thread.
    pub fn start(&self, script: String) -> Result<ScriptHandle> {
        let id = self.allocate_id()?;
        let cancel = CancelToken::new();
        self.active.lock()?.insert(id, cancel.clone());

        let (sender, outcomes) = mpsc::channel();
        let db = Arc::clone(&self.db);
        let active = Arc::clone(&self.active);
        let token = cancel.clone();
        let join = std::thread::spawn(move || {
            let engine = Engine::new(&db);
            let ran = engine.execute_with(&script, |outcome| {
                // a dropped receiver stops the script like a cancellation
                !token.is_cancelled() && sender.send(outcome).is_ok()
            });
            if let Ok(mut active) = active.lock() {
                active.remove(&id);
            }
            match &ran {
                Ok(ran) => debug!(?id, ran, "script finished"),
                Err(e) => warn!(?id, error = %e, "script failed"),
            }
            ran
        });

        Ok(ScriptHandle {
            id,
            cancel,
            started: Instant::now(),
            join: Some(join),
            outcomes,
        })
    }

    /// Runs a script on the current thread, as for startup scripts.
    pub fn run_sync(&self, script: &str) -> Result<Vec<Outcome>> {
        Engine::new(&self.db).execute(script)
    }

    /// Cancels a running script by id.
    pub fn cancel(&self, id: ScriptId) -> Result<bool> {
        Ok(match self.active.lock()?.get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        })
    }

    pub fn running(&self) -> Result<usize> {
        Ok(self.active.lock()?.len())
    }
}
