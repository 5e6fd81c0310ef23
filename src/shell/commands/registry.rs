use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use super::command_trait::{CmdIn, CmdOut, Command, EXIT_NOT_FOUND, EXIT_OK};
use super::context::CommandContext;

/// Registry that holds all simulated commands, keyed by name and alias.
pub struct CommandRegistry {
    commands: HashMap<&'static str, Arc<dyn Command>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            commands: HashMap::new(),
        }
    }

    pub fn register(&mut self, command: Arc<dyn Command>) {
        for alias in command.aliases() {
            self.commands.insert(alias, command.clone());
        }
        self.commands.insert(command.name(), command);
    }

    pub fn has_command(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    /// Run one argv against the registry. Unknown names get the shell's
    /// not-found reply and exit 127. An `Err` means the output side is
    /// gone (downstream pipe closed or connection dropped); the caller
    /// decides whether that is worth recording.
    pub async fn dispatch(
        &self,
        args: &[String],
        input: &mut CmdIn,
        out: &mut CmdOut<'_>,
        ctx: &CommandContext,
    ) -> io::Result<i32> {
        let Some(name) = args.first() else {
            return Ok(EXIT_OK);
        };
        match self.commands.get(name.as_str()) {
            Some(cmd) => cmd.run(args, input, out, ctx).await,
            None => {
                out.println(&format!("{name}: 未找到命令")).await?;
                Ok(EXIT_NOT_FOUND)
            }
        }
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}
