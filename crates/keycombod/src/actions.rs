use crate::state_machine::ComboActions;
use anyhow::{Context, Result};
use keycombo_core::config::ActionsConfig;
use std::process::{Command, ExitStatus};
use tracing::{error, info, warn};

/// Runs the configured commands when the combo is held or released.
///
/// Commands run to completion on the worker, so the lease covering an action
/// stays held until its command has exited.
pub struct CommandActions {
    on_held: Vec<String>,
    on_released: Vec<String>,
}

impl CommandActions {
    pub fn from_config(config: &ActionsConfig) -> Self {
        Self {
            on_held: config.on_held.clone(),
            on_released: config.on_released.clone(),
        }
    }

    fn run(action: &str, argv: &[String]) {
        if argv.is_empty() {
            info!(action, "no command configured");
            return;
        }
        match run_command(argv) {
            Ok(status) if status.success() => info!(action, command = ?argv, "command finished"),
            Ok(status) => warn!(action, command = ?argv, code = ?status.code(), "command failed"),
            Err(e) => error!(action, command = ?argv, error = %e, "could not run command"),
        }
    }
}

impl ComboActions for CommandActions {
    fn on_held(&self) {
        Self::run("held", &self.on_held);
    }

    fn on_released(&self) {
        Self::run("released", &self.on_released);
    }
}

/// Spawn `argv[0]` with the remaining arguments and wait for it.
pub fn run_command(argv: &[String]) -> Result<ExitStatus> {
    let (program, args) = argv.split_first().context("empty command")?;
    Command::new(program)
        .args(args)
        .status()
        .with_context(|| format!("spawning {}", program))
}
