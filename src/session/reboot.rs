//! Delayed reboot after a successful handoff

use std::io;
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::info;

pub trait RebootScheduler: Send + Sync {
    /// Arrange a reboot after `delay` without blocking the session
    fn schedule(&self, delay: Duration) -> io::Result<()>;
}

/// Detached `sh -c "sleep N && reboot"`
pub struct CommandReboot {
    command: String,
}

impl CommandReboot {
    pub fn new() -> Self {
        Self::with_command("reboot")
    }

    pub fn with_command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    fn script(&self, delay: Duration) -> String {
        format!("sleep {} && {}", delay.as_secs(), self.command)
    }
}

impl Default for CommandReboot {
    fn default() -> Self {
        Self::new()
    }
}

impl RebootScheduler for CommandReboot {
    fn schedule(&self, delay: Duration) -> io::Result<()> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(self.script(delay))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        info!(pid = child.id(), delay_seconds = delay.as_secs(), "reboot scheduled");
        Ok(())
    }
}
