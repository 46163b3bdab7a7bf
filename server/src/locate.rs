//! Executable discovery.
//!
//! An [`ExecutableLocator`] walks an ordered list of [`Candidate`]s and returns
//! the first one that resolves to an executable file. The first hit is
//! memoized for the life of the locator; misses are not, so a later call can
//! still find a binary installed in the meantime. A binary replaced after the
//! first hit is not noticed without a restart.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing::debug;

use crate::config::{AgentConfig, TunnelConfig};
use crate::util::{expand_tilde, home_dir};

/// One place an executable may live, tried in list order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidate {
    /// A configured path, used as-is.
    Explicit(PathBuf),
    /// A bare name looked up in every `PATH` entry.
    OnPath(String),
    /// A name inside a well-known install directory.
    InDir(PathBuf, String),
}

impl Candidate {
    fn resolve(&self, search_path: Option<&OsString>) -> Option<PathBuf> {
        match self {
            Candidate::Explicit(path) => is_executable(path).then(|| path.clone()),
            Candidate::OnPath(name) => search_path.and_then(|paths| {
                std::env::split_paths(paths)
                    .filter(|dir| !dir.as_os_str().is_empty())
                    .map(|dir| dir.join(name))
                    .find(|p| is_executable(p))
            }),
            Candidate::InDir(dir, name) => {
                let path = dir.join(name);
                is_executable(&path).then_some(path)
            }
        }
    }
}

/// Ordered, memoizing executable lookup.
#[derive(Debug)]
pub struct ExecutableLocator {
    label: &'static str,
    candidates: Vec<Candidate>,
    search_path: Option<OsString>,
    resolved: OnceLock<PathBuf>,
}

impl ExecutableLocator {
    /// Locator over an explicit candidate list, searching the process `PATH`.
    pub fn new(label: &'static str, candidates: Vec<Candidate>) -> Self {
        Self {
            label,
            candidates,
            search_path: std::env::var_os("PATH"),
            resolved: OnceLock::new(),
        }
    }

    /// Replace the search path used for [`Candidate::OnPath`] entries.
    #[must_use]
    pub fn with_search_path(mut self, search_path: Option<OsString>) -> Self {
        self.search_path = search_path;
        self
    }

    /// Agent CLI lookup: configured path, then each candidate name on `PATH`,
    /// then each name under `~/go/bin`, `/usr/local/bin`, `/opt/homebrew/bin`.
    pub fn for_agent(config: &AgentConfig) -> Self {
        let mut candidates = Vec::new();
        if let Some(ref exe) = config.executable {
            candidates.push(Candidate::Explicit(PathBuf::from(expand_tilde(exe).as_ref())));
        }
        candidates.extend(config.candidates.iter().cloned().map(Candidate::OnPath));
        for dir in well_known_dirs(&[home_dir().map(|h| h.join("go/bin"))]) {
            for name in &config.candidates {
                candidates.push(Candidate::InDir(dir.clone(), name.clone()));
            }
        }
        Self::new("agent", candidates)
    }

    /// Tunnel binary lookup: configured path, `cloudflared` on `PATH`, then the
    /// private install directory `~/.moltbot/bin` and the system prefixes.
    pub fn for_tunnel(config: &TunnelConfig) -> Self {
        let name = "cloudflared".to_string();
        let mut candidates = Vec::new();
        if let Some(ref binary) = config.binary {
            candidates.push(Candidate::Explicit(PathBuf::from(
                expand_tilde(binary).as_ref(),
            )));
        }
        candidates.push(Candidate::OnPath(name.clone()));
        for dir in well_known_dirs(&[home_dir().map(|h| h.join(".moltbot/bin"))]) {
            candidates.push(Candidate::InDir(dir, name.clone()));
        }
        Self::new("tunnel", candidates)
    }

    /// The candidate list, in priority order.
    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    /// Resolve the executable, returning the memoized hit when there is one.
    pub fn resolve(&self) -> Result<PathBuf, LocateError> {
        if let Some(path) = self.resolved.get() {
            return Ok(path.clone());
        }
        let found = self
            .candidates
            .iter()
            .find_map(|c| c.resolve(self.search_path.as_ref()))
            .ok_or(LocateError::NotFound {
                label: self.label,
                tried: self.candidates.len(),
            })?;
        debug!("Located {} executable: {}", self.label, found.display());
        // A concurrent resolver may have won the race; either answer is valid.
        Ok(self.resolved.get_or_init(|| found).clone())
    }
}

/// User-specific directories first, then the standard and Homebrew prefixes.
fn well_known_dirs(user_dirs: &[Option<PathBuf>]) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = user_dirs.iter().flatten().cloned().collect();
    dirs.push(PathBuf::from("/usr/local/bin"));
    dirs.push(PathBuf::from("/opt/homebrew/bin"));
    dirs
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|m| m.is_file())
}

/// Errors from [`ExecutableLocator::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocateError {
    /// Every candidate was checked and none is an executable file.
    NotFound { label: &'static str, tried: usize },
}

impl std::fmt::Display for LocateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LocateError::NotFound { label, tried } => {
                write!(f, "{label} executable not found ({tried} locations checked)")
            }
        }
    }
}

impl std::error::Error for LocateError {}
