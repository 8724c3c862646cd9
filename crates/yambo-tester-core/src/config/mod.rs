//! Effective run parameters.
//!
//! Four layers are merged key by key: command line, user-local file,
//! package-default file and the built-in defaults. The first layer that
//! defines a key wins; lists are taken whole from that layer.

use crate::domain::{ExecutableRole, ParallelMode, TesterError};
use crate::numerics::ToleranceDefaults;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_CONFIG_TEMPLATE: &str = include_str!("default_config.toml");
pub const USER_CONFIG_FILE_NAME: &str = "config.toml";

/// Behavior when a run directory already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CollisionPolicy {
    #[default]
    Fail,
    Clear,
}

impl FromStr for CollisionPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fail" => Ok(Self::Fail),
            "clear" => Ok(Self::Clear),
            other => Err(format!(
                "unknown collision policy '{}'; expected 'fail' or 'clear'",
                other
            )),
        }
    }
}

impl Display for CollisionPolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fail => f.write_str("fail"),
            Self::Clear => f.write_str("clear"),
        }
    }
}

/// One layer of parameters. `None` means "not defined here".
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PartialParameters {
    pub label: Option<String>,
    pub tests_dir: Option<PathBuf>,
    pub scratch_dir: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub yambo_bin: Option<PathBuf>,
    pub yambo: Option<String>,
    pub ypp: Option<String>,
    pub p2y: Option<String>,
    pub a2y: Option<String>,
    pub c2y: Option<String>,
    pub yambo_ph: Option<String>,
    pub ypp_ph: Option<String>,
    pub yambo_sc: Option<String>,
    pub ypp_sc: Option<String>,
    pub yambo_rt: Option<String>,
    pub ypp_rt: Option<String>,
    pub yambo_nl: Option<String>,
    pub ypp_nl: Option<String>,
    pub mpi_launcher: Option<String>,
    pub nprocs: Option<i64>,
    pub threads: Option<i64>,
    pub workers: Option<i64>,
    pub modes: Option<Vec<ParallelMode>>,
    pub tolerance: Option<f64>,
    pub abs_tolerance: Option<f64>,
    pub timeout_secs: Option<i64>,
    pub session_timeout_secs: Option<i64>,
    pub on_collision: Option<CollisionPolicy>,
    pub keep_scratch: Option<bool>,
    pub include: Option<Vec<String>>,
    pub exclude: Option<Vec<String>>,
    pub download_link: Option<String>,
    pub checksum: Option<bool>,
    pub report: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub verbose: Option<bool>,
}

impl PartialParameters {
    /// Hard-coded defaults, the lowest precedence layer. `tests_dir` is
    /// deliberately absent: it has to come from a file or the command line.
    pub fn built_in() -> Self {
        Self {
            label: Some("cirun".to_string()),
            tests_dir: None,
            scratch_dir: Some(PathBuf::from("scratch")),
            cache_dir: Some(PathBuf::from("cache")),
            yambo_bin: None,
            yambo: Some("yambo".to_string()),
            ypp: Some("ypp".to_string()),
            p2y: Some("p2y".to_string()),
            a2y: Some("a2y".to_string()),
            c2y: Some("c2y".to_string()),
            yambo_ph: Some("yambo_ph".to_string()),
            ypp_ph: Some("ypp_ph".to_string()),
            yambo_sc: Some("yambo_sc".to_string()),
            ypp_sc: Some("ypp_sc".to_string()),
            yambo_rt: Some("yambo_rt".to_string()),
            ypp_rt: Some("ypp_rt".to_string()),
            yambo_nl: Some("yambo_nl".to_string()),
            ypp_nl: Some("ypp_nl".to_string()),
            mpi_launcher: Some("mpirun".to_string()),
            nprocs: Some(2),
            threads: Some(1),
            workers: Some(1),
            modes: Some(vec![ParallelMode::Serial]),
            tolerance: Some(0.1),
            abs_tolerance: Some(1.0e-5),
            timeout_secs: Some(3600),
            session_timeout_secs: Some(0),
            on_collision: Some(CollisionPolicy::Fail),
            keep_scratch: Some(true),
            include: Some(Vec::new()),
            exclude: Some(Vec::new()),
            download_link: Some("https://media.yambo-code.eu/robots/databases/tests".to_string()),
            checksum: Some(true),
            report: Some(PathBuf::from("yambo_tester_report.json")),
            log_file: Some(PathBuf::from("yambo_tester.log")),
            verbose: Some(false),
        }
    }

    /// Keeps every key defined in `self` and fills the rest from `lower`.
    pub fn overlay(self, lower: PartialParameters) -> PartialParameters {
        PartialParameters {
            label: self.label.or(lower.label),
            tests_dir: self.tests_dir.or(lower.tests_dir),
            scratch_dir: self.scratch_dir.or(lower.scratch_dir),
            cache_dir: self.cache_dir.or(lower.cache_dir),
            yambo_bin: self.yambo_bin.or(lower.yambo_bin),
            yambo: self.yambo.or(lower.yambo),
            ypp: self.ypp.or(lower.ypp),
            p2y: self.p2y.or(lower.p2y),
            a2y: self.a2y.or(lower.a2y),
            c2y: self.c2y.or(lower.c2y),
            yambo_ph: self.yambo_ph.or(lower.yambo_ph),
            ypp_ph: self.ypp_ph.or(lower.ypp_ph),
            yambo_sc: self.yambo_sc.or(lower.yambo_sc),
            ypp_sc: self.ypp_sc.or(lower.ypp_sc),
            yambo_rt: self.yambo_rt.or(lower.yambo_rt),
            ypp_rt: self.ypp_rt.or(lower.ypp_rt),
            yambo_nl: self.yambo_nl.or(lower.yambo_nl),
            ypp_nl: self.ypp_nl.or(lower.ypp_nl),
            mpi_launcher: self.mpi_launcher.or(lower.mpi_launcher),
            nprocs: self.nprocs.or(lower.nprocs),
            threads: self.threads.or(lower.threads),
            workers: self.workers.or(lower.workers),
            modes: self.modes.or(lower.modes),
            tolerance: self.tolerance.or(lower.tolerance),
            abs_tolerance: self.abs_tolerance.or(lower.abs_tolerance),
            timeout_secs: self.timeout_secs.or(lower.timeout_secs),
            session_timeout_secs: self.session_timeout_secs.or(lower.session_timeout_secs),
            on_collision: self.on_collision.or(lower.on_collision),
            keep_scratch: self.keep_scratch.or(lower.keep_scratch),
            include: self.include.or(lower.include),
            exclude: self.exclude.or(lower.exclude),
            download_link: self.download_link.or(lower.download_link),
            checksum: self.checksum.or(lower.checksum),
            report: self.report.or(lower.report),
            log_file: self.log_file.or(lower.log_file),
            verbose: self.verbose.or(lower.verbose),
        }
    }

    fn executable_name(&self, role: ExecutableRole) -> Option<&String> {
        match role {
            ExecutableRole::Yambo => self.yambo.as_ref(),
            ExecutableRole::Ypp => self.ypp.as_ref(),
            ExecutableRole::P2y => self.p2y.as_ref(),
            ExecutableRole::A2y => self.a2y.as_ref(),
            ExecutableRole::C2y => self.c2y.as_ref(),
            ExecutableRole::YamboPh => self.yambo_ph.as_ref(),
            ExecutableRole::YppPh => self.ypp_ph.as_ref(),
            ExecutableRole::YamboSc => self.yambo_sc.as_ref(),
            ExecutableRole::YppSc => self.ypp_sc.as_ref(),
            ExecutableRole::YamboRt => self.yambo_rt.as_ref(),
            ExecutableRole::YppRt => self.ypp_rt.as_ref(),
            ExecutableRole::YamboNl => self.yambo_nl.as_ref(),
            ExecutableRole::YppNl => self.ypp_nl.as_ref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerSource {
    CommandLine,
    UserFile(PathBuf),
    PackageFile(PathBuf),
    PackageTemplate,
    BuiltIn,
}

impl Display for LayerSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CommandLine => f.write_str("command line"),
            Self::UserFile(path) => write!(f, "user config '{}'", path.display()),
            Self::PackageFile(path) => write!(f, "package config '{}'", path.display()),
            Self::PackageTemplate => f.write_str("packaged config template"),
            Self::BuiltIn => f.write_str("built-in defaults"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigLayer {
    pub source: LayerSource,
    pub parameters: PartialParameters,
}

impl ConfigLayer {
    pub fn new(source: LayerSource, parameters: PartialParameters) -> Self {
        Self { source, parameters }
    }
}

/// Fully resolved parameters for one invocation. Never mutated after
/// [`resolve`] returns it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectiveConfig {
    pub label: String,
    pub tests_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub yambo_bin: Option<PathBuf>,
    pub executables: BTreeMap<ExecutableRole, String>,
    pub mpi_launcher: Option<String>,
    pub nprocs: usize,
    pub threads: usize,
    pub workers: usize,
    pub modes: Vec<ParallelMode>,
    pub tolerance: ToleranceDefaults,
    #[serde(rename = "timeout_secs", serialize_with = "serialize_duration_secs")]
    pub timeout: Duration,
    /// Wall-clock budget for the whole invocation; `None` when unlimited.
    #[serde(rename = "session_timeout_secs", serialize_with = "serialize_optional_duration_secs")]
    pub session_timeout: Option<Duration>,
    pub on_collision: CollisionPolicy,
    pub keep_scratch: bool,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub download_link: String,
    pub checksum: bool,
    pub report_path: PathBuf,
    pub log_file: PathBuf,
    pub verbose: bool,
    pub sources: Vec<String>,
}

impl EffectiveConfig {
    pub fn executable_name(&self, role: ExecutableRole) -> &str {
        self.executables
            .get(&role)
            .map(String::as_str)
            .unwrap_or(role.as_str())
    }

    pub fn needs_launcher(&self) -> bool {
        self.modes.iter().any(|mode| mode.uses_launcher())
    }
}

fn serialize_duration_secs<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(duration.as_secs())
}

fn serialize_optional_duration_secs<S>(
    duration: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(duration.map_or(0, |duration| duration.as_secs()))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        source: Box<toml::de::Error>,
    },
    #[error("parameter '{key}' has no value in any configuration source")]
    Missing { key: &'static str },
    #[error("parameter '{key}' is invalid: {message}")]
    OutOfRange { key: &'static str, message: String },
    #[error("config file '{}' already exists", path.display())]
    TemplateExists { path: PathBuf },
    #[error("failed to write config template '{}': {source}", path.display())]
    WriteTemplate {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl From<ConfigError> for TesterError {
    fn from(error: ConfigError) -> Self {
        let message = error.to_string();
        match error {
            ConfigError::Read { .. } => TesterError::io_system("IO.CONFIG_READ", message),
            ConfigError::Parse { .. } => TesterError::input_validation("INPUT.CONFIG_PARSE", message),
            ConfigError::Missing { .. } => {
                TesterError::input_validation("INPUT.CONFIG_MISSING", message)
            }
            ConfigError::OutOfRange { .. } => {
                TesterError::input_validation("INPUT.CONFIG_RANGE", message)
            }
            ConfigError::TemplateExists { .. } => {
                TesterError::input_validation("INPUT.CONFIG_TEMPLATE", message)
            }
            ConfigError::WriteTemplate { .. } => {
                TesterError::io_system("IO.CONFIG_TEMPLATE", message)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigDocument {
    #[serde(default)]
    parameters: PartialParameters,
}

pub fn parse_config_str(content: &str, origin: &Path) -> Result<PartialParameters, ConfigError> {
    toml::from_str::<ConfigDocument>(content)
        .map(|document| document.parameters)
        .map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source: Box::new(source),
        })
}

pub fn load_config_file(path: &Path) -> Result<PartialParameters, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config_str(&content, path)
}

/// Reads the file layers and merges them with the command line and the
/// built-in defaults. Without `package_config` the template compiled into
/// the crate is the package-default layer.
pub fn resolve(
    cli: &PartialParameters,
    user_config: Option<&Path>,
    package_config: Option<&Path>,
) -> Result<EffectiveConfig, ConfigError> {
    let mut layers = vec![ConfigLayer::new(LayerSource::CommandLine, cli.clone())];

    if let Some(path) = user_config {
        layers.push(ConfigLayer::new(
            LayerSource::UserFile(path.to_path_buf()),
            load_config_file(path)?,
        ));
    }

    match package_config {
        Some(path) => layers.push(ConfigLayer::new(
            LayerSource::PackageFile(path.to_path_buf()),
            load_config_file(path)?,
        )),
        None => layers.push(ConfigLayer::new(
            LayerSource::PackageTemplate,
            parse_config_str(DEFAULT_CONFIG_TEMPLATE, Path::new("<packaged template>"))?,
        )),
    }

    resolve_layers(layers)
}

/// Merges layers given highest precedence first; the built-in defaults are
/// always appended as the last layer.
pub fn resolve_layers(layers: Vec<ConfigLayer>) -> Result<EffectiveConfig, ConfigError> {
    let mut sources = Vec::with_capacity(layers.len() + 1);
    let mut merged = PartialParameters::default();
    for layer in layers {
        sources.push(layer.source.to_string());
        merged = merged.overlay(layer.parameters);
    }
    sources.push(LayerSource::BuiltIn.to_string());
    merged = merged.overlay(PartialParameters::built_in());

    finalize(merged, sources)
}

fn finalize(merged: PartialParameters, sources: Vec<String>) -> Result<EffectiveConfig, ConfigError> {
    let mut executables = BTreeMap::new();
    for role in ExecutableRole::ALL {
        let name = non_empty(merged.executable_name(role).map(String::as_str))
            .ok_or(ConfigError::Missing { key: role.as_str() })?;
        executables.insert(role, name.to_string());
    }

    let mut modes = Vec::new();
    for mode in merged.modes.ok_or(ConfigError::Missing { key: "modes" })? {
        if !modes.contains(&mode) {
            modes.push(mode);
        }
    }
    if modes.is_empty() {
        return Err(ConfigError::OutOfRange {
            key: "modes",
            message: "at least one parallel mode is required".to_string(),
        });
    }

    let mpi_launcher = non_empty(merged.mpi_launcher.as_deref()).map(str::to_string);
    if mpi_launcher.is_none() && modes.iter().any(|mode| mode.uses_launcher()) {
        return Err(ConfigError::Missing {
            key: "mpi_launcher",
        });
    }

    let tolerance = merged.tolerance.ok_or(ConfigError::Missing { key: "tolerance" })?;
    if !(0.0..=1.0).contains(&tolerance) {
        return Err(ConfigError::OutOfRange {
            key: "tolerance",
            message: format!("expected a fraction between 0 and 1, got {}", tolerance),
        });
    }
    let abs_tolerance = merged
        .abs_tolerance
        .ok_or(ConfigError::Missing { key: "abs_tolerance" })?;
    if !abs_tolerance.is_finite() || abs_tolerance < 0.0 {
        return Err(ConfigError::OutOfRange {
            key: "abs_tolerance",
            message: format!("expected a non-negative number, got {}", abs_tolerance),
        });
    }

    let timeout_secs = positive("timeout_secs", merged.timeout_secs)?;
    let session_timeout_secs = merged.session_timeout_secs.unwrap_or(0);
    if session_timeout_secs < 0 {
        return Err(ConfigError::OutOfRange {
            key: "session_timeout_secs",
            message: format!("expected zero (unlimited) or a positive number, got {}", session_timeout_secs),
        });
    }

    Ok(EffectiveConfig {
        label: non_empty(merged.label.as_deref())
            .ok_or(ConfigError::Missing { key: "label" })?
            .to_string(),
        tests_dir: non_empty_path(merged.tests_dir).ok_or(ConfigError::Missing { key: "tests_dir" })?,
        scratch_dir: non_empty_path(merged.scratch_dir)
            .ok_or(ConfigError::Missing { key: "scratch_dir" })?,
        cache_dir: non_empty_path(merged.cache_dir).ok_or(ConfigError::Missing { key: "cache_dir" })?,
        yambo_bin: non_empty_path(merged.yambo_bin),
        executables,
        mpi_launcher,
        nprocs: positive("nprocs", merged.nprocs)?,
        threads: positive("threads", merged.threads)?,
        workers: positive("workers", merged.workers)?,
        modes,
        tolerance: ToleranceDefaults {
            relative: tolerance,
            absolute: abs_tolerance,
        },
        timeout: Duration::from_secs(timeout_secs as u64),
        session_timeout: (session_timeout_secs > 0)
            .then(|| Duration::from_secs(session_timeout_secs as u64)),
        on_collision: merged.on_collision.unwrap_or_default(),
        keep_scratch: merged.keep_scratch.unwrap_or(true),
        include: merged.include.unwrap_or_default(),
        exclude: merged.exclude.unwrap_or_default(),
        download_link: non_empty(merged.download_link.as_deref())
            .ok_or(ConfigError::Missing {
                key: "download_link",
            })?
            .trim_end_matches('/')
            .to_string(),
        checksum: merged.checksum.unwrap_or(true),
        report_path: non_empty_path(merged.report).ok_or(ConfigError::Missing { key: "report" })?,
        log_file: non_empty_path(merged.log_file).ok_or(ConfigError::Missing { key: "log_file" })?,
        verbose: merged.verbose.unwrap_or(false),
        sources,
    })
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn non_empty_path(value: Option<PathBuf>) -> Option<PathBuf> {
    value.filter(|path| !path.as_os_str().is_empty())
}

fn positive(key: &'static str, value: Option<i64>) -> Result<usize, ConfigError> {
    let value = value.ok_or(ConfigError::Missing { key })?;
    if value < 1 {
        return Err(ConfigError::OutOfRange {
            key,
            message: format!("expected a positive integer, got {}", value),
        });
    }
    usize::try_from(value).map_err(|_| ConfigError::OutOfRange {
        key,
        message: format!("value {} does not fit this platform", value),
    })
}

/// Writes the packaged template; never overwrites an existing file.
pub fn write_template(path: &Path) -> Result<(), ConfigError> {
    if path.exists() {
        return Err(ConfigError::TemplateExists {
            path: path.to_path_buf(),
        });
    }
    fs::write(path, DEFAULT_CONFIG_TEMPLATE).map_err(|source| ConfigError::WriteTemplate {
        path: path.to_path_buf(),
        source,
    })
}
