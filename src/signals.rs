use crate::config::AgentConfig;
use crate::intake::{DeploymentQueue, Intake};
use signal_hook::{
    consts::{SIGHUP, SIGINT, SIGTERM},
    iterator::Signals,
};
use std::process::ExitCode;
use std::sync::Arc;

pub fn send_signal(signal: crate::cli::Signal) -> ExitCode {
    let pid_file = &crate::cli::get_cli_args().pid_file;

    let pid = match std::fs::read_to_string(pid_file) {
        Ok(pid) => pid,
        Err(err) => {
            eprintln!("Unable to read pid file: {err}");
            return ExitCode::FAILURE;
        }
    };

    let pid: i32 = match pid.trim().parse() {
        Ok(pid) => pid,
        Err(err) => {
            eprintln!("Unable to parse pid: {err}");
            return ExitCode::FAILURE;
        }
    };

    let signal: nix::sys::signal::Signal = signal.into();
    if let Err(err) = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), signal) {
        eprintln!("Unable to send signal: {err}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

pub fn write_pid_file() -> std::io::Result<()> {
    std::fs::write(
        &crate::cli::get_cli_args().pid_file,
        std::process::id().to_string(),
    )
}

pub fn remove_pid_file() {
    let _ = std::fs::remove_file(&crate::cli::get_cli_args().pid_file);
}

/// SIGINT and SIGTERM close the queue so the reconciler exits after the
/// deployment in progress. A second stop signal exits immediately.
/// SIGHUP re-reads the service catalog.
pub fn handle_signals(queue: Arc<DeploymentQueue>, intake: Arc<Intake>) -> std::io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    std::thread::spawn(move || {
        let mut stopping = false;
        for signal in signals.forever() {
            match signal {
                SIGHUP => reload(&intake),
                _ if stopping => {
                    log::warn!("Received a second stop signal, exiting now");
                    remove_pid_file();
                    std::process::exit(1);
                }
                _ => {
                    let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Stopping]);
                    log::info!("Stopping after the current deployment");
                    stopping = true;
                    queue.close();
                }
            }
        }
    });

    Ok(())
}

fn reload(intake: &Intake) {
    let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Reloading]);
    match AgentConfig::try_init().and_then(|config| config.catalog()) {
        Ok(catalog) => intake.reload_catalog(catalog),
        Err(err) => log::error!("Unable to read new config: {err}"),
    }
    let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);
}
