use crate::scheduler::process::{CancellationToken, CommandSpec, ProcessLauncher};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Capabilities the core executable reports about its own build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildInfo {
    pub version: Option<String>,
    pub revision: Option<String>,
    pub hash: Option<String>,
    pub mpi: bool,
    pub openmp: bool,
    pub double_precision: bool,
    pub scalapack: bool,
    pub slepc: bool,
    pub parallel_io: bool,
}

/// Reads the `Version` and `Configuration` lines printed by `yambo -h`.
/// Returns `None` when neither line is present.
pub fn parse_build_info(text: &str) -> Option<BuildInfo> {
    let mut info = BuildInfo::default();
    let mut recognized = false;

    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        if key.ends_with("Version") {
            let tokens = value.split_whitespace().collect::<Vec<_>>();
            info.version = tokens.first().map(|token| token.to_string());
            info.revision = tokens.get(2).map(|token| token.to_string());
            info.hash = tokens.get(4).map(|token| token.to_string());
            recognized = true;
        } else if key.ends_with("Configuration") {
            for feature in value.split('+').map(|feature| feature.trim().to_ascii_lowercase()) {
                match feature.as_str() {
                    "mpi" => info.mpi = true,
                    "openmp" => info.openmp = true,
                    "dp" => info.double_precision = true,
                    "slk" => info.scalapack = true,
                    "slepc" => info.slepc = true,
                    "hdf5_mpi_io" => info.parallel_io = true,
                    _ => {}
                }
            }
            recognized = true;
        }
    }

    recognized.then_some(info)
}

/// Runs `<yambo> -h` and parses its banner. Failures only produce a warning.
pub fn probe_build_info(
    yambo: &Path,
    work_dir: &Path,
    launcher: &dyn ProcessLauncher,
    cancel: &CancellationToken,
) -> Option<BuildInfo> {
    let spec = CommandSpec::new(yambo, work_dir).arg("-h");
    match launcher.launch(&spec, PROBE_TIMEOUT, cancel) {
        Ok(capture) => {
            let combined = format!("{}\n{}", capture.stderr, capture.stdout);
            let info = parse_build_info(&combined);
            if info.is_none() {
                warn!(executable = %yambo.display(), "could not read build information");
            }
            info
        }
        Err(error) => {
            warn!(executable = %yambo.display(), %error, "build information probe failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::parse_build_info;

    #[test]
    fn parses_version_and_configuration_lines() {
        let banner = "\
 Version: 5.2.1 Revision 22947 Hash 3a4d9b1cd
 Configuration: MPI+OpenMP+SLK+SLEPC+HDF5_MPI_IO
 Usage: yambo -i -o <string> ...";
        let info = parse_build_info(banner).expect("banner should parse");
        assert_eq!(info.version.as_deref(), Some("5.2.1"));
        assert_eq!(info.revision.as_deref(), Some("22947"));
        assert_eq!(info.hash.as_deref(), Some("3a4d9b1cd"));
        assert!(info.mpi && info.openmp && info.scalapack && info.slepc && info.parallel_io);
        assert!(!info.double_precision);
    }

    #[test]
    fn unrelated_text_yields_nothing() {
        assert_eq!(parse_build_info("segmentation fault\n"), None);
    }
}
