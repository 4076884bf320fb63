//! One-time provisioning gate.
//!
//! Provisioning is skipped whenever the completion marker exists. The marker
//! is written only after provisioning succeeds and never expires; clearing it
//! is the only way to force a rebuild.

use std::path::PathBuf;

use anyhow::{Context, Result};

pub trait MarkerStore {
    fn exists(&self) -> Result<bool>;

    fn commit(&self) -> Result<()>;

    /// Returns whether a marker was present.
    fn clear(&self) -> Result<bool>;
}

/// Marker stored as a file; existence is the whole state.
#[derive(Debug, Clone)]
pub struct FsMarkerStore {
    path: PathBuf,
}

impl FsMarkerStore {
    pub fn new(path: PathBuf) -> Self {
        FsMarkerStore { path }
    }
}

impl MarkerStore for FsMarkerStore {
    fn exists(&self) -> Result<bool> {
        match std::fs::metadata(&self.path) {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => {
                Err(err).with_context(|| format!("stat stage marker: {}", self.path.display()))
            }
        }
    }

    fn commit(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create marker dir: {}", parent.display()))?;
        }
        std::fs::write(&self.path, b"ok\n")
            .with_context(|| format!("write stage marker: {}", self.path.display()))
    }

    fn clear(&self) -> Result<bool> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => {
                Err(err).with_context(|| format!("remove stage marker: {}", self.path.display()))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Skipped,
    Provisioned,
}

pub struct StageGate<'a> {
    store: &'a dyn MarkerStore,
}

impl<'a> StageGate<'a> {
    pub fn new(store: &'a dyn MarkerStore) -> Self {
        StageGate { store }
    }

    pub fn check(&self) -> Result<bool> {
        self.store.exists()
    }

    pub fn commit(&self) -> Result<()> {
        self.store.commit()
    }

    /// Runs `provision` unless already done. An error leaves the marker absent.
    pub fn run<F>(&self, provision: F) -> Result<StageOutcome>
    where
        F: FnOnce() -> Result<()>,
    {
        if self.check()? {
            tracing::info!("stage marker present; skipping provisioning");
            return Ok(StageOutcome::Skipped);
        }
        tracing::info!("stage marker absent; provisioning");
        provision()?;
        self.commit()?;
        Ok(StageOutcome::Provisioned)
    }
}
