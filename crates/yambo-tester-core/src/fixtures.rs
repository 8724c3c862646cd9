//! Database tarballs shared by the runs of a test.
//!
//! Tarballs live in the cache directory as `<name>_<variant>.tar.gz`, are
//! downloaded with `wget` when absent and unpacked with `tar`.

use crate::catalog::TestDefinition;
use crate::scheduler::process::{CancellationToken, CommandSpec, LaunchError, ProcessLauncher};
use crate::scheduler::scratch::{ScratchError, merge_tree};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("download of '{url}' failed: {detail}")]
    Download { url: String, detail: String },
    #[error("SHA-256 mismatch for '{}': expected {expected}, found {actual}", path.display())]
    Checksum {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("failed to read '{}': {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to extract '{}': {detail}", path.display())]
    Extract { path: PathBuf, detail: String },
    #[error(transparent)]
    Scratch(#[from] ScratchError),
}

/// Settings shared by every fetch of one invocation.
#[derive(Clone, Copy)]
pub struct FetchContext<'a> {
    pub cache_dir: &'a Path,
    pub download_link: &'a str,
    pub verify_checksum: bool,
    pub timeout: Duration,
    pub launcher: &'a dyn ProcessLauncher,
    pub cancel: &'a CancellationToken,
}

pub fn sha256_file(path: &Path) -> Result<String, FetchError> {
    let read_error = |source| FetchError::Read {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open(path).map_err(read_error)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0_u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(read_error)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    let digest = hasher.finalize();
    Ok(format!("{digest:x}"))
}

/// Returns the cached tarball of `test`, downloading it first when it is
/// missing. The checksum declared by the test is verified unless disabled;
/// a mismatching file is removed from the cache.
pub fn ensure_tarball(test: &TestDefinition, context: &FetchContext<'_>) -> Result<PathBuf, FetchError> {
    let tarball_name = test.tarball_name();
    let tarball = context.cache_dir.join(&tarball_name);

    if tarball.is_file() {
        info!(test = %test.id, tarball = %tarball_name, "tarball already cached");
    } else {
        download(&tarball_name, &tarball, context)?;
    }

    if let (true, Some(expected)) = (context.verify_checksum, test.tarball_sha256.as_deref()) {
        let actual = sha256_file(&tarball)?;
        if actual != expected {
            warn!(test = %test.id, tarball = %tarball_name, "checksum mismatch; removing cached file");
            let _ = fs::remove_file(&tarball);
            return Err(FetchError::Checksum {
                path: tarball,
                expected: expected.to_string(),
                actual,
            });
        }
    }

    Ok(tarball)
}

fn download(tarball_name: &str, target: &Path, context: &FetchContext<'_>) -> Result<(), FetchError> {
    let url = format!("{}/{}", context.download_link, tarball_name);
    let partial_name = format!("{tarball_name}.part");
    let partial = target.with_file_name(&partial_name);
    info!(url = %url, "downloading tarball");

    // wget runs inside the cache directory, so the output is a bare name.
    let spec = CommandSpec::new("wget", context.cache_dir)
        .arg("-q")
        .arg(url.clone())
        .arg("-O")
        .arg(partial_name);
    let failure = |detail: String| FetchError::Download {
        url: url.clone(),
        detail,
    };

    let capture = context
        .launcher
        .launch(&spec, context.timeout, context.cancel)
        .map_err(|error| failure(launch_detail(error)))?;
    if !capture.succeeded() {
        let _ = fs::remove_file(&partial);
        let detail = if capture.timed_out {
            "timed out".to_string()
        } else if capture.cancelled {
            "cancelled".to_string()
        } else {
            format!(
                "wget exited with {:?}: {}",
                capture.exit_code,
                capture.stderr_tail(3)
            )
        };
        return Err(failure(detail));
    }

    fs::rename(&partial, target).map_err(|source| {
        FetchError::from(ScratchError::Rename {
            from: partial.clone(),
            to: target.to_path_buf(),
            source,
        })
    })
}

fn launch_detail(error: LaunchError) -> String {
    match error {
        LaunchError::NotFound { .. } => "wget is not installed".to_string(),
        other => other.to_string(),
    }
}

/// Unpacks `tarball` into `run_dir`. Archives rooted at a `<variant>/`
/// directory have that level stripped.
pub fn extract_tarball(
    tarball: &Path,
    run_dir: &Path,
    variant: &str,
    context: &FetchContext<'_>,
) -> Result<(), FetchError> {
    let extract_error = |detail: String| FetchError::Extract {
        path: tarball.to_path_buf(),
        detail,
    };
    let archive = fs::canonicalize(tarball).map_err(|source| FetchError::Read {
        path: tarball.to_path_buf(),
        source,
    })?;
    let run_name = run_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staging = run_dir.with_file_name(format!(".{run_name}.extract"));
    fs::create_dir_all(&staging).map_err(|source| ScratchError::Create {
        path: staging.clone(),
        source,
    })?;

    let spec = CommandSpec::new("tar", &staging)
        .arg("-xzf")
        .arg(archive.display().to_string());
    let result = context
        .launcher
        .launch(&spec, context.timeout, context.cancel)
        .map_err(|error| extract_error(error.to_string()))
        .and_then(|capture| {
            if capture.succeeded() {
                Ok(())
            } else {
                Err(extract_error(format!(
                    "tar exited with {:?}: {}",
                    capture.exit_code,
                    capture.stderr_tail(3)
                )))
            }
        })
        .and_then(|()| {
            let nested = staging.join(variant);
            let root = if nested.is_dir() { nested } else { staging.clone() };
            merge_tree(&root, run_dir).map_err(FetchError::from)
        });

    let _ = fs::remove_dir_all(&staging);
    result
}
