use crate::catalog::TestDefinition;
use crate::config::{CollisionPolicy, EffectiveConfig};
use crate::domain::{ParallelMode, TesterError};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

#[derive(Debug, thiserror::Error)]
pub enum ScratchError {
    #[error("'{}' exists but is not a directory", path.display())]
    NotADirectory { path: PathBuf },
    #[error("failed to create '{}': {source}", path.display())]
    Create { path: PathBuf, source: io::Error },
    #[error("directory '{}' already exists", path.display())]
    Collision { path: PathBuf },
    #[error("failed to clear '{}': {source}", path.display())]
    Clear { path: PathBuf, source: io::Error },
    #[error("failed to copy '{}' to '{}': {source}", from.display(), to.display())]
    Copy {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },
    #[error("failed to walk '{}': {source}", path.display())]
    Walk {
        path: PathBuf,
        source: walkdir::Error,
    },
    #[error("failed to move '{}' to '{}': {source}", from.display(), to.display())]
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },
}

impl From<ScratchError> for TesterError {
    fn from(error: ScratchError) -> Self {
        TesterError::io_system("IO.SCRATCH", error.to_string())
    }
}

/// Directories shared by every run of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLayout {
    pub session_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl SessionLayout {
    pub fn run_directory(&self, test: &TestDefinition, mode: ParallelMode) -> PathBuf {
        self.session_dir
            .join(&test.name)
            .join(format!("{}@{}", test.variant, mode))
    }
}

/// Creates scratch and cache roots when missing and a fresh session
/// directory `<scratch>/<timestamp>_<label>` inside scratch. An existing
/// session directory is handled by `config.on_collision`.
pub fn prepare_session(config: &EffectiveConfig, timestamp: u64) -> Result<SessionLayout, ScratchError> {
    ensure_directory(&config.scratch_dir)?;
    ensure_directory(&config.cache_dir)?;

    let session_dir = config
        .scratch_dir
        .join(format!("{}_{}", timestamp, config.label));
    create_exclusive_directory(&session_dir, config.on_collision)?;
    info!(session = %session_dir.display(), "scratch session created");

    Ok(SessionLayout {
        session_dir,
        cache_dir: config.cache_dir.clone(),
    })
}

pub fn ensure_directory(path: &Path) -> Result<(), ScratchError> {
    if path.is_dir() {
        return Ok(());
    }
    if path.exists() {
        return Err(ScratchError::NotADirectory {
            path: path.to_path_buf(),
        });
    }
    warn!(path = %path.display(), "creating missing directory");
    fs::create_dir_all(path).map_err(|source| ScratchError::Create {
        path: path.to_path_buf(),
        source,
    })
}

/// Creates `path` exclusively. An existing directory is either a
/// collision or, with [`CollisionPolicy::Clear`], removed first.
pub fn create_exclusive_directory(path: &Path, policy: CollisionPolicy) -> Result<(), ScratchError> {
    if path.exists() {
        match policy {
            CollisionPolicy::Fail => {
                return Err(ScratchError::Collision {
                    path: path.to_path_buf(),
                });
            }
            CollisionPolicy::Clear => {
                warn!(path = %path.display(), "clearing existing directory");
                fs::remove_dir_all(path).map_err(|source| ScratchError::Clear {
                    path: path.to_path_buf(),
                    source,
                })?;
            }
        }
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ScratchError::Create {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    fs::create_dir(path).map_err(|source| {
        if source.kind() == io::ErrorKind::AlreadyExists {
            ScratchError::Collision {
                path: path.to_path_buf(),
            }
        } else {
            ScratchError::Create {
                path: path.to_path_buf(),
                source,
            }
        }
    })
}

fn walk_error(root: &Path, source: walkdir::Error) -> ScratchError {
    let path = source.path().unwrap_or(root).to_path_buf();
    ScratchError::Walk { path, source }
}

/// Copies `from` into `to` recursively. Symlinks are followed, so a linked
/// `SAVE` arrives as a real directory.
pub fn copy_tree(from: &Path, to: &Path) -> Result<(), ScratchError> {
    for entry in WalkDir::new(from).follow_links(true) {
        let entry = entry.map_err(|source| walk_error(from, source))?;
        let Ok(relative) = entry.path().strip_prefix(from) else {
            continue;
        };
        let target = to.join(relative);
        let copied = if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
        } else {
            fs::copy(entry.path(), &target).map(|_| ())
        };
        copied.map_err(|source| ScratchError::Copy {
            from: entry.path().to_path_buf(),
            to: target.clone(),
            source,
        })?;
    }
    Ok(())
}

/// Moves the entries of `from` into `to`, merging directories. Files from
/// `from` replace files already present in `to`.
pub fn merge_tree(from: &Path, to: &Path) -> Result<(), ScratchError> {
    let mut entries = WalkDir::new(from).min_depth(1).into_iter();
    while let Some(entry) = entries.next() {
        let entry = entry.map_err(|source| walk_error(from, source))?;
        let Ok(relative) = entry.path().strip_prefix(from) else {
            continue;
        };
        let target = to.join(relative);
        let is_dir = entry.file_type().is_dir();
        if is_dir && target.is_dir() {
            continue;
        }

        let rename_error = |source| ScratchError::Rename {
            from: entry.path().to_path_buf(),
            to: target.clone(),
            source,
        };
        if target.is_dir() {
            fs::remove_dir_all(&target).map_err(rename_error)?;
        } else if target.exists() || target.is_symlink() {
            fs::remove_file(&target).map_err(rename_error)?;
        }
        fs::rename(entry.path(), &target).map_err(rename_error)?;
        // The whole subtree moved with it.
        if is_dir {
            entries.skip_current_dir();
        }
    }
    Ok(())
}

/// Promotes `SAVE_converted` to `SAVE`, keeping the previous `SAVE` as
/// `oldSAVE`. Returns whether a conversion was found.
pub fn promote_converted_save(run_dir: &Path) -> Result<bool, ScratchError> {
    let converted = run_dir.join("SAVE_converted");
    if !converted.is_dir() {
        return Ok(false);
    }

    let save = run_dir.join("SAVE");
    if save.exists() {
        let old = run_dir.join("oldSAVE");
        fs::rename(&save, &old).map_err(|source| ScratchError::Rename {
            from: save.clone(),
            to: old,
            source,
        })?;
    }
    fs::rename(&converted, &save).map_err(|source| ScratchError::Rename {
        from: converted,
        to: save.clone(),
        source,
    })?;
    Ok(true)
}

pub fn remove_run_directory(path: &Path) {
    if let Err(error) = fs::remove_dir_all(path) {
        warn!(path = %path.display(), %error, "failed to remove run directory");
    }
}
