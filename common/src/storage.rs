use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use log::{info, warn};
use thiserror::Error;

use crate::{
    display::{Presenter, MSG_CARD_FOUND, MSG_LOGGING_DISABLED, MSG_LOGGING_ENABLED},
    types::{LogState, Sample, LOG_HEADER},
};

#[derive(Debug, Clone, Error)]
pub enum MountError {
    #[error("no card detected")]
    NoCard,
    #[error("card present but not usable")]
    Unsupported,
    #[error("storage driver error: {0}")]
    Driver(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("logging is not enabled")]
    Disabled,
    #[error("mount failed: {0}")]
    Mount(#[from] MountError),
    #[error("creating log file failed: {0}")]
    Create(#[source] io::Error),
    #[error("writing header to new log file failed: {0}")]
    WriteNew(#[source] io::Error),
    #[error("opening existing log file failed: {0}")]
    OpenExisting(#[source] io::Error),
    #[error("writing header to existing log file failed: {0}")]
    WriteExisting(#[source] io::Error),
    #[error("opening log file for append failed: {0}")]
    OpenAppend(#[source] io::Error),
    #[error("appending record failed: {0}")]
    Append(#[source] io::Error),
}

impl StorageError {
    /// Short operator-facing wording for the display.
    pub fn display_text(&self) -> &'static str {
        match self {
            Self::Disabled => MSG_LOGGING_DISABLED,
            Self::Mount(MountError::NoCard) => "No SD Card found!",
            Self::Mount(MountError::Unsupported) => "No compatible SD Card found!",
            Self::Mount(MountError::Driver(_)) => "SD Card mount failed!",
            Self::Create(_) => "Error creating log file!",
            Self::WriteNew(_) => "Error writing to log file!",
            Self::OpenExisting(_) => "Failed to open existing file!",
            Self::WriteExisting(_) => "Failed to write to existing file!",
            Self::OpenAppend(_) => "Failed to open file for appending",
            Self::Append(_) => "Append failed",
        }
    }
}

/// Removable medium holding the log. Paths are absolute within the medium
/// (`/data.log`).
pub trait Volume {
    type File: Write;

    fn mount(&mut self) -> Result<(), MountError>;

    fn exists(&self, path: &str) -> bool;

    /// Creates or truncates `path` for writing.
    fn create(&mut self, path: &str) -> io::Result<Self::File>;

    /// Opens `path` positioned at its end, creating it when missing.
    fn open_append(&mut self, path: &str) -> io::Result<Self::File>;
}

/// A medium that is already visible as a directory of the host filesystem,
/// either a plain directory on a workstation or a FAT volume the platform
/// mounted into its VFS.
#[derive(Debug, Clone)]
pub struct DirVolume {
    root: PathBuf,
}

impl DirVolume {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

impl Volume for DirVolume {
    type File = File;

    fn mount(&mut self) -> Result<(), MountError> {
        match std::fs::metadata(&self.root) {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(MountError::Unsupported),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(MountError::NoCard),
            Err(err) => Err(MountError::Driver(err.to_string())),
        }
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).exists()
    }

    fn create(&mut self, path: &str) -> io::Result<File> {
        File::create(self.resolve(path))
    }

    fn open_append(&mut self, path: &str) -> io::Result<File> {
        OpenOptions::new()
            .append(true)
            .create(true)
            .open(self.resolve(path))
    }
}

/// Append-only delimited log on a removable medium.
///
/// The handle is opened and closed inside every write so a power cut costs at
/// most one partial record. Once preparation fails the logger stays disabled
/// until the process restarts.
pub struct StorageLogger<V> {
    volume: V,
    path: String,
    state: LogState,
    records_written: u64,
}

impl<V: Volume> StorageLogger<V> {
    pub fn new(volume: V, path: impl Into<String>) -> Self {
        Self {
            volume,
            path: path.into(),
            state: LogState::Unopened,
            records_written: 0,
        }
    }

    /// A logger that never touches the medium, for builds with logging
    /// switched off in the config.
    pub fn disabled(volume: V, path: impl Into<String>) -> Self {
        Self {
            state: LogState::Disabled,
            ..Self::new(volume, path)
        }
    }

    pub fn state(&self) -> LogState {
        self.state
    }

    pub fn is_enabled(&self) -> bool {
        self.state == LogState::Enabled
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    pub fn volume(&self) -> &V {
        &self.volume
    }

    pub fn prepare<P>(&mut self, presenter: &mut P) -> LogState
    where
        P: Presenter + ?Sized,
    {
        if self.state == LogState::Disabled {
            return self.state;
        }

        match self.open_with_header() {
            Ok(()) => {
                self.state = LogState::Enabled;
                info!("data logging enabled ({})", self.path);
                presenter.show_status(&format!(
                    "{MSG_CARD_FOUND}\n{MSG_LOGGING_ENABLED}\nFile: {}",
                    self.path.trim_start_matches('/')
                ));
            }
            Err(err) => {
                self.state = LogState::Disabled;
                warn!("data logging disabled: {err}");
                presenter.show_error(&format!("{}\n{MSG_LOGGING_DISABLED}", err.display_text()));
            }
        }

        self.state
    }

    pub fn append<P>(&mut self, sample: &Sample, presenter: &mut P) -> Result<(), StorageError>
    where
        P: Presenter + ?Sized,
    {
        if self.state != LogState::Enabled {
            return Err(StorageError::Disabled);
        }

        let line = sample.to_log_line();
        let result = self
            .volume
            .open_append(&self.path)
            .map_err(StorageError::OpenAppend)
            .and_then(|mut file| {
                file.write_all(line.as_bytes())
                    .and_then(|()| file.flush())
                    .map_err(StorageError::Append)
            });

        match result {
            Ok(()) => {
                self.records_written = self.records_written.saturating_add(1);
                Ok(())
            }
            Err(err) => {
                warn!("log append failed: {err}");
                presenter.show_error(err.display_text());
                Err(err)
            }
        }
    }

    fn open_with_header(&mut self) -> Result<(), StorageError> {
        if self.state == LogState::Unopened {
            self.volume.mount()?;
        }

        if self.volume.exists(&self.path) {
            let mut file = self
                .volume
                .open_append(&self.path)
                .map_err(StorageError::OpenExisting)?;
            file.write_all(b"\n")
                .and_then(|()| file.write_all(LOG_HEADER.as_bytes()))
                .and_then(|()| file.flush())
                .map_err(StorageError::WriteExisting)?;
        } else {
            let mut file = self
                .volume
                .create(&self.path)
                .map_err(StorageError::Create)?;
            file.write_all(LOG_HEADER.as_bytes())
                .and_then(|()| file.flush())
                .map_err(StorageError::WriteNew)?;
        }

        Ok(())
    }
}
