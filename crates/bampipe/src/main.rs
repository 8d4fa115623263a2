mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(
    name = "bampipe",
    version,
    about = "BAM pipe table checks and simulated connection runs"
)]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cmd::run(cli.command, format);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_check_subcommand() {
        let cli = Cli::try_parse_from(["bampipe", "check", "/tmp/pipes.json"])
            .expect("check args should parse");
        assert!(matches!(cli.command, Command::Check(_)));
    }

    #[test]
    fn parses_timer_settings() {
        let cli = Cli::try_parse_from([
            "bampipe",
            "timers",
            "/tmp/pipes.json",
            "--set",
            "hsusb 100,hsic 0",
        ])
        .expect("timers args should parse");

        match cli.command {
            Command::Timers(args) => assert_eq!(args.set.as_deref(), Some("hsusb 100,hsic 0")),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::try_parse_from([
            "bampipe",
            "simulate",
            "/tmp/pipes.json",
            "--handshake",
            "--format",
            "pretty",
            "--log-level",
            "debug",
        ])
        .expect("simulate args should parse");

        assert_eq!(cli.format, Some(OutputFormat::Pretty));
        assert!(matches!(cli.command, Command::Simulate(ref args) if args.handshake));
    }

    #[test]
    fn check_requires_a_config_path() {
        let err = Cli::try_parse_from(["bampipe", "check"]).expect_err("missing path should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }
}
