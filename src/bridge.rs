// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
//! Hand-off of a "sample pack to import" between independent parts of the
//! workspace. The payload is persisted under a fixed key so it survives a
//! navigation or restart, and listeners are signalled when it is written.
//! Whoever takes it first consumes it.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    process,
    sync::atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, span, warn, Level, Span};

use crate::banks::{BankSource, SamplePaths};

/// Fixed storage key of the pending import.
pub const PENDING_IMPORT_KEY: &str = "pending-sample-import";

/// A sample pack waiting to be imported.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingImport {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    pub map: BTreeMap<String, SamplePaths>,
}

impl PendingImport {
    /// The bank source this import registers.
    pub fn source(&self) -> BankSource {
        BankSource::Mapping(self.map.clone())
    }
}

/// Signal sent to listeners whenever a new import is stashed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImportSignal;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("pending import storage error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed pending import: {0}")]
    Json(#[from] serde_json::Error),
}

/// File backed pending-import store with change notification.
pub struct ImportBridge {
    path: PathBuf,
    signal: broadcast::Sender<ImportSignal>,
    span: Span,
}

impl ImportBridge {
    /// Creates a bridge storing its payload inside the given directory.
    pub fn new<P: Into<PathBuf>>(dir: P) -> ImportBridge {
        let (signal, _) = broadcast::channel(8);
        ImportBridge {
            path: dir.into().join(format!("{}.json", PENDING_IMPORT_KEY)),
            signal,
            span: span!(Level::INFO, "bridge"),
        }
    }

    /// The file the payload is stored in.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Subscribes to stash notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ImportSignal> {
        self.signal.subscribe()
    }

    /// Persists the payload, replacing any previous one, and signals listeners.
    pub fn stash(&self, import: &PendingImport) -> Result<(), BridgeError> {
        let _enter = self.span.enter();

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.scratch_path("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(import)?)?;
        fs::rename(&tmp, &self.path)?;

        info!(
            label = import.label,
            sounds = import.map.len(),
            "Stashed pending sample import."
        );

        // Nobody listening is fine; the payload waits on disk.
        let _ = self.signal.send(ImportSignal);
        Ok(())
    }

    /// Reads the payload without consuming it.
    pub fn peek(&self) -> Result<Option<PendingImport>, BridgeError> {
        match fs::read(&self.path) {
            Ok(contents) => Ok(Some(serde_json::from_slice(&contents)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Consumes the payload. Only one caller ever receives a given payload,
    /// across bridges and processes sharing the storage: the file is claimed
    /// by renaming it before it is read. A malformed payload is discarded so
    /// it can't wedge later imports.
    pub fn take(&self) -> Result<Option<PendingImport>, BridgeError> {
        let _enter = self.span.enter();

        let claimed = self.scratch_path("taken");
        match fs::rename(&self.path, &claimed) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let contents = fs::read(&claimed);
        if let Err(e) = fs::remove_file(&claimed) {
            warn!(path = %claimed.display(), err = %e, "Unable to remove claimed import.");
        }

        match serde_json::from_slice::<PendingImport>(&contents?) {
            Ok(import) => {
                info!(label = import.label, "Consumed pending sample import.");
                Ok(Some(import))
            }
            Err(e) => {
                warn!(err = e.to_string(), "Discarding malformed pending import.");
                Err(e.into())
            }
        }
    }

    /// Deletes any stored payload.
    pub fn clear(&self) -> Result<(), BridgeError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Waits for the next signal and tries to consume the payload. Returns
    /// `None` if another listener got there first or the bridge went away.
    pub async fn next_import(
        &self,
        signals: &mut broadcast::Receiver<ImportSignal>,
    ) -> Result<Option<PendingImport>, BridgeError> {
        match signals.recv().await {
            Ok(ImportSignal) => self.take(),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "Import listener lagged behind.");
                self.take()
            }
            Err(broadcast::error::RecvError::Closed) => Ok(None),
        }
    }

    /// A file next to the payload that no other bridge uses.
    fn scratch_path(&self, suffix: &str) -> PathBuf {
        static SCRATCH: AtomicU64 = AtomicU64::new(0);
        let n = SCRATCH.fetch_add(1, Ordering::Relaxed);
        self.path
            .with_extension(format!("json.{}-{}.{}", process::id(), n, suffix))
    }
}
