//! Shell command executor.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;

use crate::flow::step::{Step, StepExecutor};
use crate::flow::FlowContext;

/// Runs the context text as a shell command.
///
/// The command runs through `sh -c` in `path` (empty inherits the process
/// working directory). A non-zero exit status is an error carrying stderr.
/// With `output_to_context`, stdout replaces the context text; otherwise the
/// text is left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunCommandExecutor {
    /// Suppress command logging.
    pub silent: bool,
    /// Replace the context text with the command's stdout.
    pub output_to_context: bool,
    /// Working directory; empty inherits.
    pub path: String,
}

#[async_trait]
impl StepExecutor for RunCommandExecutor {
    async fn run(&self, ctx: &mut FlowContext, step: &Step) -> Result<(), anyhow::Error> {
        let command_line = ctx.text.clone();
        if !self.silent {
            log::info!("step '{}' running command: {}", step.name, command_line);
        }

        let mut command = Command::new("sh");
        command.arg("-c").arg(&command_line);
        if !self.path.is_empty() {
            command.current_dir(&self.path);
        }

        let output = command
            .output()
            .await
            .map_err(|e| anyhow::anyhow!("failed to spawn command '{}': {}", command_line, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow::anyhow!(
                "command '{}' exited with {}: {}",
                command_line,
                output.status,
                stderr.trim()
            ));
        }

        if self.output_to_context {
            ctx.text = String::from_utf8_lossy(&output.stdout).to_string();
        }
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn StepExecutor> {
        Box::new(self.clone())
    }

    fn load_config(&mut self, config: &Value) -> Result<(), anyhow::Error> {
        *self = serde_json::from_value(config.clone())?;
        Ok(())
    }
}
