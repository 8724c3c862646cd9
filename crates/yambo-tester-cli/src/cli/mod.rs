mod commands;
mod interrupt;
mod logging;

use clap::Parser;
use yambo_tester_core::domain::TesterError;

pub fn run_from_env() -> i32 {
    let args = std::env::args().skip(1).collect::<Vec<_>>();

    match run(args) {
        Ok(code) => code,
        Err(error) => {
            let tester_error = error.as_tester_error();
            eprintln!("{}", tester_error.diagnostic_line());
            if let Some(summary_line) = tester_error.fatal_exit_line() {
                eprintln!("{}", summary_line);
            }
            tester_error.exit_code()
        }
    }
}

pub fn run<I, S>(args: I) -> Result<i32, CliError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let full_args = std::iter::once("yambo-tester".to_string())
        .chain(args.into_iter().map(Into::into))
        .collect::<Vec<_>>();
    parse_and_dispatch(full_args)
}

fn parse_and_dispatch(args: Vec<String>) -> Result<i32, CliError> {
    match Cli::try_parse_from(&args) {
        Ok(cli) => dispatch_parsed(cli),
        Err(err) => match err.kind() {
            clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                print!("{}", err);
                Ok(0)
            }
            _ => Err(CliError::Usage(err.to_string())),
        },
    }
}

#[derive(Parser)]
#[command(
    name = "yambo-tester",
    version,
    about = "Regression test driver for the Yambo simulation suite"
)]
struct Cli {
    /// Write the configuration template to ./config.toml and exit
    #[arg(long, conflicts_with_all = ["download_only", "list"])]
    init: bool,

    /// Only populate the database cache for the selected tests
    #[arg(long, conflicts_with = "list")]
    download_only: bool,

    /// Print the planned (test, mode) runs without executing them
    #[arg(long)]
    list: bool,

    /// User configuration file (default: ./config.toml when present)
    #[arg(long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Package default configuration file (default: the built-in template)
    #[arg(long, value_name = "PATH")]
    package_config: Option<std::path::PathBuf>,

    #[command(flatten)]
    parameters: commands::ParameterArgs,
}

fn dispatch_parsed(cli: Cli) -> Result<i32, CliError> {
    if cli.init {
        return commands::run_init_command();
    }

    let config = commands::resolve_config(&cli)?;
    logging::init(&config.log_file, config.verbose)?;
    tracing::debug!(sources = ?config.sources, "configuration resolved");

    if cli.list {
        commands::run_list_command(&config)
    } else if cli.download_only {
        commands::run_download_command(&config)
    } else {
        commands::run_suite_command(&config)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error("{0}")]
    Compute(TesterError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<TesterError> for CliError {
    fn from(error: TesterError) -> Self {
        Self::Compute(error)
    }
}

impl CliError {
    fn as_tester_error(&self) -> TesterError {
        match self {
            Self::Usage(message) => {
                TesterError::input_validation("INPUT.CLI_USAGE", message.trim_end().to_string())
            }
            Self::Compute(error) => error.clone(),
            Self::Internal(error) => TesterError::io_system("IO.CLI", format!("{error:#}")),
        }
    }
}
