//! Audit copies of deleted messages.

use crate::config::MainConfig;
use crate::suspect::Suspect;
use anyhow::Context;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const TRASH_LOG_NAME: &str = "00-trash.log";

#[derive(Debug, Clone)]
pub struct Trash {
    dir: PathBuf,
    log_enabled: bool,
}

impl Trash {
    pub fn new(dir: impl Into<PathBuf>, log_enabled: bool) -> Self {
        Self {
            dir: dir.into(),
            log_enabled,
        }
    }

    /// `None` when no trash directory is configured.
    pub fn from_config(main: &MainConfig) -> Option<Self> {
        let dir = main.trashdir.trim();
        if dir.is_empty() {
            None
        } else {
            Some(Self::new(dir, main.trashlog))
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Copy the message into the trash directory. Failures are logged; the
    /// delete goes ahead either way.
    pub fn store(&self, suspect: &Suspect, killer: &str) -> Option<PathBuf> {
        match self.try_store(suspect, killer) {
            Ok(path) => {
                log::debug!("{}: Message stored to trash: {}", suspect.id, path.display());
                Some(path)
            }
            Err(e) => {
                log::error!("{}: could not write to trash: {e:#}", suspect.id);
                None
            }
        }
    }

    fn try_store(&self, suspect: &Suspect, killer: &str) -> anyhow::Result<PathBuf> {
        if !self.dir.is_dir() {
            std::fs::create_dir_all(&self.dir)
                .with_context(|| format!("cannot create trash directory {}", self.dir.display()))?;
        }

        let source = suspect.source()?;
        let mut file = tempfile::Builder::new()
            .prefix(&format!("{}-", suspect.id))
            .tempfile_in(&self.dir)
            .with_context(|| format!("cannot create file in {}", self.dir.display()))?;
        file.write_all(&source)?;
        let (_, path) = file.keep()?;

        if self.log_enabled {
            if let Err(e) = self.append_log(suspect, killer, &path) {
                log::error!("{}: could not write trash log: {e:#}", suspect.id);
            }
        }
        Ok(path)
    }

    fn append_log(&self, suspect: &Suspect, killer: &str, path: &Path) -> anyhow::Result<()> {
        let log_path = self.dir.join(TRASH_LOG_NAME);
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("cannot open {}", log_path.display()))?;
        writeln!(
            log,
            "{} {} {} {} {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            suspect.from_address,
            suspect.to_address().unwrap_or_default(),
            killer,
            path.display()
        )?;
        Ok(())
    }
}
