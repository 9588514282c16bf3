use anyhow::{bail, Context};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use cmdrun_core::{CommandRequest, Config, ExecutionState, VERSION};
use cmdrun_runner::{check_versions, version_request, ProcessRunner, VersionCheck};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::debug;

/// Exit code when the command timed out (same as coreutils `timeout`)
const EXIT_TIMED_OUT: u8 = 124;
/// Exit code when the command could not be started
const EXIT_FAILED_TO_START: u8 = 127;

#[derive(Parser)]
#[command(name = "cmdrun")]
#[command(about = "Run external commands and report how they ended", long_about = None)]
#[command(disable_version_flag = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Print the version and exit
    #[arg(short = 'V', long)]
    version: bool,

    /// Configuration file (defaults to $CMDRUN_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command and pass its output and exit code through
    Exec {
        /// Kill the command after this many seconds
        #[arg(short, long, value_parser = parse_timeout)]
        timeout: Option<Duration>,

        /// Working directory for the command
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Set an environment variable (KEY=VALUE), repeatable
        #[arg(short, long = "env", value_parser = parse_env)]
        env: Vec<(String, String)>,

        /// Start from an empty environment instead of inheriting this one
        #[arg(long)]
        clear_env: bool,

        /// Capture stderr together with stdout
        #[arg(long)]
        merge_stderr: bool,

        /// Log every captured line at debug level
        #[arg(long)]
        log_output: bool,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,

        /// Program and its arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Check that each tool prints exactly the expected version for --version
    CheckVersions {
        /// Version every tool must print (defaults to this build's version)
        #[arg(long)]
        expect: Option<String>,

        /// Per-tool timeout in seconds
        #[arg(short, long, value_parser = parse_timeout)]
        timeout: Option<Duration>,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,

        /// Tools to check (defaults to the configured list)
        tools: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if cli.version {
        println!("{}", VERSION);
        return Ok(ExitCode::SUCCESS);
    }

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        return Ok(ExitCode::from(2));
    };

    let config = Config::resolve(cli.config.as_deref()).context("Failed to load configuration")?;
    debug!(?config, "Resolved configuration");

    match command {
        Commands::Exec {
            timeout,
            cwd,
            env,
            clear_env,
            merge_stderr,
            log_output,
            format,
            command,
        } => {
            let mut request = CommandRequest::from_argv(command)?
                .envs(env)
                .redirect_stderr(merge_stderr)
                .log_output(log_output);
            if clear_env {
                request = request.clear_env();
            }
            if let Some(dir) = cwd {
                request = request.current_dir(dir);
            }
            if let Some(timeout) = timeout {
                request = request.timeout(timeout);
            }

            run_command(config.apply(request), format).await
        }
        Commands::CheckVersions {
            expect,
            timeout,
            format,
            tools,
        } => {
            let tools = if tools.is_empty() { config.tools.clone() } else { tools };
            if tools.is_empty() {
                bail!("No tools given and none configured under `tools`");
            }
            let expected = expect.unwrap_or_else(|| VERSION.to_string());

            let requests = tools
                .iter()
                .map(|tool| config.apply(version_request(tool, timeout)))
                .collect();
            let checks = check_versions(requests, &expected).await;

            print_checks(&checks, format)?;
            Ok(if checks.iter().all(VersionCheck::passed) {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

async fn run_command(request: CommandRequest, format: OutputFormat) -> anyhow::Result<ExitCode> {
    let runner = ProcessRunner::new(request);
    runner.run().await?;

    match format {
        OutputFormat::Text => {
            std::io::stdout().write_all(&runner.raw_output())?;
            std::io::stderr().write_all(runner.error_text().as_bytes())?;
            match runner.execution_state() {
                ExecutionState::FailedToStart { reason } => eprintln!("cmdrun: {}", reason),
                ExecutionState::TimedOut { timeout } => {
                    eprintln!("cmdrun: timed out after {:?}", timeout)
                }
                _ => {}
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&runner.report())?);
        }
    }
    std::io::stdout().flush()?;

    Ok(ExitCode::from(exit_status_for(&runner.execution_state())))
}

/// Exit code `cmdrun exec` reports for a terminal state
fn exit_status_for(state: &ExecutionState) -> u8 {
    match state {
        ExecutionState::Finished {
            signal: Some(signal),
            ..
        } => 128u8.saturating_add(u8::try_from(*signal).unwrap_or(0)),
        ExecutionState::Finished { exit_code, .. } => u8::try_from(*exit_code).unwrap_or(1),
        ExecutionState::TimedOut { .. } => EXIT_TIMED_OUT,
        ExecutionState::FailedToStart { .. } => EXIT_FAILED_TO_START,
        ExecutionState::NotStarted | ExecutionState::Running { .. } => 1,
    }
}

fn print_checks(checks: &[VersionCheck], format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(checks)?),
        OutputFormat::Text => {
            for check in checks {
                match check.problem() {
                    None => println!("ok    {}", check.tool),
                    Some(problem) => println!("FAIL  {}: {}", check.tool, problem),
                }
            }
            let failed = checks.iter().filter(|c| !c.passed()).count();
            println!(
                "\n{} tool(s) checked, {} failed (expected version {})",
                checks.len(),
                failed,
                checks.first().map(|c| c.expected.as_str()).unwrap_or(VERSION)
            );
        }
    }
    Ok(())
}

fn parse_timeout(value: &str) -> Result<Duration, String> {
    let secs: f64 = value
        .parse()
        .map_err(|_| format!("'{}' is not a number of seconds", value))?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(format!("timeout must be a positive number of seconds, got {}", value));
    }
    Duration::try_from_secs_f64(secs).map_err(|e| format!("timeout {} is out of range: {}", value, e))
}

fn parse_env(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((key, val)) if !key.is_empty() => Ok((key.to_string(), val.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timeout() {
        assert_eq!(parse_timeout("1.5").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_timeout("10").unwrap(), Duration::from_secs(10));
        assert!(parse_timeout("0").is_err());
        assert!(parse_timeout("-1").is_err());
        assert!(parse_timeout("soon").is_err());
        assert!(parse_timeout("inf").is_err());
        assert!(parse_timeout("1e30").unwrap_err().contains("out of range"));
    }

    #[test]
    fn test_parse_env() {
        assert_eq!(
            parse_env("LANG=C").unwrap(),
            ("LANG".to_string(), "C".to_string())
        );
        assert_eq!(
            parse_env("OPTS=a=b").unwrap(),
            ("OPTS".to_string(), "a=b".to_string())
        );
        assert_eq!(parse_env("EMPTY=").unwrap().1, "");
        assert!(parse_env("=value").is_err());
        assert!(parse_env("novalue").is_err());
    }

    #[test]
    fn test_exit_status_for() {
        assert_eq!(
            exit_status_for(&ExecutionState::Finished {
                exit_code: 0,
                signal: None
            }),
            0
        );
        assert_eq!(
            exit_status_for(&ExecutionState::Finished {
                exit_code: 3,
                signal: None
            }),
            3
        );
        assert_eq!(
            exit_status_for(&ExecutionState::Finished {
                exit_code: -9,
                signal: Some(9)
            }),
            137
        );
        assert_eq!(
            exit_status_for(&ExecutionState::TimedOut {
                timeout: Duration::from_secs(1)
            }),
            EXIT_TIMED_OUT
        );
        assert_eq!(
            exit_status_for(&ExecutionState::FailedToStart {
                reason: String::new()
            }),
            EXIT_FAILED_TO_START
        );
    }

    #[test]
    fn test_cli_parses_trailing_command() {
        let cli = Cli::try_parse_from([
            "cmdrun", "exec", "-t", "2", "-e", "A=1", "--", "opengrok-indexer", "--version",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Exec {
                timeout,
                env,
                command,
                ..
            }) => {
                assert_eq!(timeout, Some(Duration::from_secs(2)));
                assert_eq!(env, vec![("A".to_string(), "1".to_string())]);
                assert_eq!(command, vec!["opengrok-indexer", "--version"]);
            }
            _ => panic!("expected exec"),
        }
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }
}
