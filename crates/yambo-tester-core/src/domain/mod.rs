pub mod errors;

pub use errors::{ErrorCategory, TesterError, TesterResult};

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Parallel execution variant a test run is launched under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParallelMode {
    #[default]
    Serial,
    OpenMp,
    Mpi,
    Hybrid,
}

impl ParallelMode {
    pub const ALL: [ParallelMode; 4] = [Self::Serial, Self::OpenMp, Self::Mpi, Self::Hybrid];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Serial => "serial",
            Self::OpenMp => "openmp",
            Self::Mpi => "mpi",
            Self::Hybrid => "hybrid",
        }
    }

    pub const fn uses_launcher(self) -> bool {
        matches!(self, Self::Mpi | Self::Hybrid)
    }

    pub const fn uses_threads(self) -> bool {
        matches!(self, Self::OpenMp | Self::Hybrid)
    }
}

impl Display for ParallelMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).as_str())
    }
}

impl FromStr for ParallelMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "serial" => Ok(Self::Serial),
            "openmp" | "omp" => Ok(Self::OpenMp),
            "mpi" => Ok(Self::Mpi),
            "hybrid" | "mpi+openmp" => Ok(Self::Hybrid),
            other => Err(format!(
                "unknown parallel mode '{}'; expected one of serial, openmp, mpi, hybrid",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoleKind {
    /// Without it no test can run.
    Core,
    /// Pre/post-processing and code-interface tools.
    Interface,
    /// Feature-specific project build.
    Project,
}

/// Logical executable a test step can invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutableRole {
    Yambo,
    Ypp,
    P2y,
    A2y,
    C2y,
    YamboPh,
    YppPh,
    YamboSc,
    YppSc,
    YamboRt,
    YppRt,
    YamboNl,
    YppNl,
}

impl ExecutableRole {
    pub const ALL: [ExecutableRole; 13] = [
        Self::Yambo,
        Self::Ypp,
        Self::P2y,
        Self::A2y,
        Self::C2y,
        Self::YamboPh,
        Self::YppPh,
        Self::YamboSc,
        Self::YppSc,
        Self::YamboRt,
        Self::YppRt,
        Self::YamboNl,
        Self::YppNl,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Yambo => "yambo",
            Self::Ypp => "ypp",
            Self::P2y => "p2y",
            Self::A2y => "a2y",
            Self::C2y => "c2y",
            Self::YamboPh => "yambo_ph",
            Self::YppPh => "ypp_ph",
            Self::YamboSc => "yambo_sc",
            Self::YppSc => "ypp_sc",
            Self::YamboRt => "yambo_rt",
            Self::YppRt => "ypp_rt",
            Self::YamboNl => "yambo_nl",
            Self::YppNl => "ypp_nl",
        }
    }

    pub const fn kind(self) -> RoleKind {
        match self {
            Self::Yambo => RoleKind::Core,
            Self::Ypp | Self::P2y | Self::A2y | Self::C2y => RoleKind::Interface,
            _ => RoleKind::Project,
        }
    }

    pub const fn is_core(self) -> bool {
        matches!(self.kind(), RoleKind::Core)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|role| role.as_str() == name.trim())
    }
}

impl Display for ExecutableRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::{ExecutableRole, ParallelMode, RoleKind};

    #[test]
    fn only_yambo_is_a_core_role() {
        let core = ExecutableRole::ALL
            .iter()
            .filter(|role| role.is_core())
            .collect::<Vec<_>>();
        assert_eq!(core, vec![&ExecutableRole::Yambo]);
        assert_eq!(ExecutableRole::P2y.kind(), RoleKind::Interface);
        assert_eq!(ExecutableRole::YamboRt.kind(), RoleKind::Project);
    }

    #[test]
    fn role_names_match_config_keys() {
        for role in ExecutableRole::ALL {
            assert_eq!(ExecutableRole::from_name(role.as_str()), Some(role));
        }
        assert_eq!(ExecutableRole::from_name("yambo_xx"), None);
    }

    #[test]
    fn parallel_mode_parses_aliases() {
        assert_eq!("omp".parse::<ParallelMode>(), Ok(ParallelMode::OpenMp));
        assert_eq!("MPI".parse::<ParallelMode>(), Ok(ParallelMode::Mpi));
        assert!("cuda".parse::<ParallelMode>().is_err());
        assert!(ParallelMode::Hybrid.uses_launcher());
        assert!(ParallelMode::Hybrid.uses_threads());
        assert!(!ParallelMode::Serial.uses_threads());
    }
}
