use std::{path::PathBuf, sync::OnceLock};

use clap::{Parser, Subcommand, ValueEnum};

/// Blue/green deployments for single-host container stacks.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to the config file.
    #[arg(short, long, default_value = "steward.toml")]
    pub config: PathBuf,

    /// Where the running agent records its pid.
    #[arg(short, long, default_value = "steward.pid")]
    pub pid_file: PathBuf,

    /// Validate the config file and exit.
    #[arg(short, long)]
    pub test: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send a signal to the running agent.
    Signal {
        #[arg(value_enum)]
        signal: Signal,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    /// Re-read the service catalog.
    Reload,
    /// Finish the current deployment and exit.
    Stop,
}

impl From<Signal> for nix::sys::signal::Signal {
    fn from(signal: Signal) -> Self {
        match signal {
            Signal::Reload => nix::sys::signal::Signal::SIGHUP,
            Signal::Stop => nix::sys::signal::Signal::SIGTERM,
        }
    }
}

static ARGS: OnceLock<Args> = OnceLock::new();

pub fn get_cli_args() -> &'static Args {
    ARGS.get_or_init(Args::parse)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_signal_subcommand() {
        let args = Args::try_parse_from(["steward", "-c", "/etc/steward.toml", "signal", "reload"])
            .unwrap();
        assert_eq!(args.config, PathBuf::from("/etc/steward.toml"));
        assert_eq!(args.pid_file, PathBuf::from("steward.pid"));
        assert!(matches!(
            args.command,
            Some(Command::Signal {
                signal: Signal::Reload
            })
        ));
    }

    #[test]
    fn maps_signals() {
        assert_eq!(
            nix::sys::signal::Signal::from(Signal::Stop),
            nix::sys::signal::Signal::SIGTERM
        );
        assert_eq!(
            nix::sys::signal::Signal::from(Signal::Reload),
            nix::sys::signal::Signal::SIGHUP
        );
    }
}
