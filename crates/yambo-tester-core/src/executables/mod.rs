//! Executable discovery.
//!
//! The core role is mandatory; interface tools and project builds are
//! optional and only recorded as absent, which later marks the tests that
//! need them as SKIPPED.

mod build_info;

pub use build_info::{BuildInfo, parse_build_info, probe_build_info};

use crate::config::EffectiveConfig;
use crate::domain::{ExecutableRole, TesterError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::env;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Resolved location of every role, plus the MPI launcher when a selected
/// mode needs one.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ExecutableSet {
    roles: BTreeMap<ExecutableRole, Option<PathBuf>>,
    launcher: Option<PathBuf>,
}

impl ExecutableSet {
    pub fn new(roles: BTreeMap<ExecutableRole, Option<PathBuf>>, launcher: Option<PathBuf>) -> Self {
        Self { roles, launcher }
    }

    pub fn path(&self, role: ExecutableRole) -> Option<&Path> {
        self.roles.get(&role).and_then(|path| path.as_deref())
    }

    pub fn is_available(&self, role: ExecutableRole) -> bool {
        self.path(role).is_some()
    }

    pub fn absent_roles(&self) -> Vec<ExecutableRole> {
        ExecutableRole::ALL
            .into_iter()
            .filter(|role| !self.is_available(*role))
            .collect()
    }

    pub fn launcher(&self) -> Option<&Path> {
        self.launcher.as_deref()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LocateError {
    #[error("core executable '{name}' ({role}) was not found in {searched}")]
    MissingCoreExecutable {
        role: ExecutableRole,
        name: String,
        searched: String,
    },
    #[error("MPI launcher '{name}' was not found in {searched}")]
    MissingLauncher { name: String, searched: String },
    #[error("executable directory '{}' does not exist", path.display())]
    MissingBinDirectory { path: PathBuf },
}

impl From<LocateError> for TesterError {
    fn from(error: LocateError) -> Self {
        let placeholder = match &error {
            LocateError::MissingCoreExecutable { .. } => "ENV.CORE_EXECUTABLE",
            LocateError::MissingLauncher { .. } => "ENV.MPI_LAUNCHER",
            LocateError::MissingBinDirectory { .. } => "ENV.BIN_DIRECTORY",
        };
        TesterError::environment(placeholder, error.to_string())
    }
}

/// Locates every role. With `yambo_bin` configured only that directory is
/// searched for the yambo-family roles; otherwise `search_path`, a
/// `PATH`-style list supplied by the caller, is used. The launcher is always
/// looked up on the search path.
pub fn locate(config: &EffectiveConfig, search_path: &OsStr) -> Result<ExecutableSet, LocateError> {
    let path_dirs = env::split_paths(search_path).collect::<Vec<_>>();

    let role_dirs = match &config.yambo_bin {
        Some(bin) => {
            if !bin.is_dir() {
                return Err(LocateError::MissingBinDirectory { path: bin.clone() });
            }
            vec![bin.clone()]
        }
        None => path_dirs.clone(),
    };
    let role_searched = describe_search(config.yambo_bin.as_deref());

    let mut roles = BTreeMap::new();
    for role in ExecutableRole::ALL {
        let name = config.executable_name(role);
        let found = find_executable(name, &role_dirs);
        match &found {
            Some(path) => debug!(role = %role, path = %path.display(), "executable located"),
            None if role.is_core() => {
                return Err(LocateError::MissingCoreExecutable {
                    role,
                    name: name.to_string(),
                    searched: role_searched,
                });
            }
            None => warn!(
                role = %role,
                name,
                "optional executable not found; tests that need it will be skipped"
            ),
        }
        roles.insert(role, found);
    }

    let launcher = match (&config.mpi_launcher, config.needs_launcher()) {
        (Some(name), true) => {
            let path = find_executable(name, &path_dirs).ok_or_else(|| LocateError::MissingLauncher {
                name: name.clone(),
                searched: describe_search(None),
            })?;
            info!(launcher = %path.display(), "MPI launcher located");
            Some(path)
        }
        _ => None,
    };

    Ok(ExecutableSet { roles, launcher })
}

fn describe_search(bin: Option<&Path>) -> String {
    match bin {
        Some(bin) => format!("'{}'", bin.display()),
        None => "PATH".to_string(),
    }
}

/// Names containing a path separator are checked as given; bare names are
/// joined onto each search directory in order. The result is absolute since
/// steps run from inside their run directory.
pub fn find_executable(name: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    let candidate = Path::new(name);
    let found = if candidate.components().count() > 1 || candidate.is_absolute() {
        is_executable_file(candidate).then(|| candidate.to_path_buf())
    } else {
        dirs.iter()
            .map(|dir| dir.join(name))
            .find(|path| is_executable_file(path))
    }?;
    Some(std::path::absolute(&found).unwrap_or(found))
}

#[cfg(unix)]
fn is_executable_file(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|metadata| metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable_file(path: &Path) -> bool {
    path.is_file()
}
