//! The simulated command set. Every command is stream-oriented and runs
//! against the session's copy-on-write filesystem; nothing here ever
//! touches the real host.

pub mod command_trait;
pub mod context;
pub mod registry;

mod fs_commands;
mod net_commands;
mod sys_commands;
mod text_commands;

use std::sync::{Arc, OnceLock};

pub use command_trait::{CmdIn, CmdOut, Command, EXIT_FAILURE, EXIT_NOT_FOUND, EXIT_OK, EXIT_USAGE};
pub use context::CommandContext;
pub use registry::CommandRegistry;

// ANSI colors, only emitted when writing to the terminal-facing sink.
pub(crate) const COLOR_RESET: &str = "\x1b[0m";
pub(crate) const COLOR_DIR: &str = "\x1b[1;34m";
pub(crate) const COLOR_EXEC: &str = "\x1b[1;32m";
pub(crate) const COLOR_MATCH: &str = "\x1b[1;31m";
pub(crate) const COLOR_FILE_TAG: &str = "\x1b[35m";

static REGISTRY: OnceLock<CommandRegistry> = OnceLock::new();

/// The process-wide command registry, built on first use.
pub fn registry() -> &'static CommandRegistry {
    REGISTRY.get_or_init(|| {
        let mut reg = CommandRegistry::new();

        reg.register(Arc::new(fs_commands::LsCommand));
        reg.register(Arc::new(fs_commands::CdCommand));
        reg.register(Arc::new(fs_commands::PwdCommand));
        reg.register(Arc::new(fs_commands::CatCommand));
        reg.register(Arc::new(fs_commands::CpCommand));
        reg.register(Arc::new(fs_commands::MvCommand));
        reg.register(Arc::new(fs_commands::MkdirCommand));
        reg.register(Arc::new(fs_commands::RmCommand));
        reg.register(Arc::new(fs_commands::TouchCommand));
        reg.register(Arc::new(fs_commands::ChmodCommand));
        reg.register(Arc::new(fs_commands::ChownCommand));

        reg.register(Arc::new(text_commands::EchoCommand));
        reg.register(Arc::new(text_commands::GrepCommand));
        reg.register(Arc::new(text_commands::HeadCommand));
        reg.register(Arc::new(text_commands::TailCommand));
        reg.register(Arc::new(text_commands::WcCommand));
        reg.register(Arc::new(text_commands::HistoryCommand));
        reg.register(Arc::new(text_commands::ExportCommand));

        reg.register(Arc::new(sys_commands::PsCommand));
        reg.register(Arc::new(sys_commands::WhoamiCommand));
        reg.register(Arc::new(sys_commands::IdCommand));
        reg.register(Arc::new(sys_commands::DateCommand));
        reg.register(Arc::new(sys_commands::UptimeCommand));
        reg.register(Arc::new(sys_commands::UnameCommand));
        reg.register(Arc::new(sys_commands::FreeCommand));
        reg.register(Arc::new(sys_commands::DfCommand));
        reg.register(Arc::new(sys_commands::ClearCommand));
        reg.register(Arc::new(sys_commands::ExitCommand));
        reg.register(Arc::new(sys_commands::SleepCommand));
        reg.register(Arc::new(sys_commands::SudoCommand));
        reg.register(Arc::new(sys_commands::NetstatCommand));
        reg.register(Arc::new(sys_commands::PagerCommand));
        reg.register(Arc::new(sys_commands::KernelPanicCommand));

        reg.register(Arc::new(net_commands::PingCommand));
        reg.register(Arc::new(net_commands::WgetCommand));
        reg.register(Arc::new(net_commands::CurlCommand));

        reg
    })
}
