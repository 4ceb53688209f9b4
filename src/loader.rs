//! File collaborator: turns a source path into a program installed in a job.

use crate::engine::{Program, ScriptEngine};
use crate::model::JobId;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("source not found: {}", .path.display())]
    SourceNotFound { path: PathBuf },
    #[error("no source file selected")]
    NoSource,
    #[error("failed to read {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed program in {}", .path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("job {job} has nothing to reload")]
    NothingToReload { job: JobId },
}

/// Loads programs into an engine's job slots.
pub trait JobLoader<E>: Send {
    /// Choose the source used by the next assemble or load.
    fn select(&mut self, _source: PathBuf) {}

    /// Check and translate the selected source. Returns the instruction count.
    fn assemble(&mut self) -> Result<usize, LoadError>;

    /// Install the selected program into `job`.
    fn load(&mut self, engine: &mut E, job: JobId) -> Result<(), LoadError>;

    /// Re-install whatever was last loaded into `job`, from the start.
    fn reload(&mut self, engine: &mut E, job: JobId) -> Result<(), LoadError>;
}

/// Reads [`Program`]s from JSON files.
#[derive(Debug, Default)]
pub struct ScriptLoader {
    source: Option<PathBuf>,
    assembled: Option<(PathBuf, Program)>,
    loaded: HashMap<JobId, PathBuf>,
}

impl ScriptLoader {
    pub fn new(source: Option<PathBuf>) -> Self {
        Self {
            source,
            ..Default::default()
        }
    }

    pub fn set_source(&mut self, path: impl Into<PathBuf>) {
        self.source = Some(path.into());
        self.assembled = None;
    }

    fn selected(&self) -> Result<&Path, LoadError> {
        self.source.as_deref().ok_or(LoadError::NoSource)
    }

    fn read(path: &Path) -> Result<Program, LoadError> {
        let text = std::fs::read_to_string(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                LoadError::SourceNotFound {
                    path: path.to_path_buf(),
                }
            } else {
                LoadError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        serde_json::from_str(&text).map_err(|source| LoadError::Malformed {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl JobLoader<ScriptEngine> for ScriptLoader {
    fn select(&mut self, source: PathBuf) {
        self.set_source(source);
    }

    fn assemble(&mut self) -> Result<usize, LoadError> {
        let path = self.selected()?.to_path_buf();
        if !path.exists() {
            return Err(LoadError::SourceNotFound { path });
        }
        let program = Self::read(&path)?;
        let len = program.len();
        info!(path = %path.display(), instructions = len, "assembled");
        self.assembled = Some((path, program));
        Ok(len)
    }

    fn load(&mut self, engine: &mut ScriptEngine, job: JobId) -> Result<(), LoadError> {
        let path = self.selected()?.to_path_buf();
        let program = match &self.assembled {
            Some((p, program)) if *p == path => program.clone(),
            _ => Self::read(&path)?,
        };
        info!(path = %path.display(), job, "loaded");
        engine.install(job, program);
        let _ = self.loaded.insert(job, path);
        Ok(())
    }

    fn reload(&mut self, engine: &mut ScriptEngine, job: JobId) -> Result<(), LoadError> {
        let path = self
            .loaded
            .get(&job)
            .cloned()
            .ok_or(LoadError::NothingToReload { job })?;
        let program = Self::read(&path)?;
        engine.install(job, program);
        Ok(())
    }
}
