//! System-flavored commands: canned-but-plausible host state, session
//! control, and the raw-mode foreground app handoff.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::PoisonError;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use tokio::sync::mpsc;

use super::command_trait::{CmdIn, CmdOut, Command, EXIT_OK};
use super::context::CommandContext;
use super::registry;
use crate::shell::filesystem::base::base;
use crate::shell::game;

pub struct PsCommand;

#[async_trait]
impl Command for PsCommand {
    fn name(&self) -> &'static str {
        "ps"
    }

    async fn run(
        &self,
        _args: &[String],
        _input: &mut CmdIn,
        out: &mut CmdOut<'_>,
        ctx: &CommandContext,
    ) -> io::Result<i32> {
        let boot = base().booted.format("%H:%M");
        let now = Local::now().format("%H:%M");
        out.println("USER         PID %CPU %MEM    VSZ   RSS TTY      STAT START   TIME COMMAND")
            .await?;
        out.println(&format!(
            "root           1  0.0  0.1 168532 12856 ?        Ss   {boot}   0:02 /sbin/init"
        ))
        .await?;
        out.println(&format!(
            "root           2  0.0  0.0      0     0 ?        S    {boot}   0:00 [kthreadd]"
        ))
        .await?;
        out.println(&format!(
            "root         832  0.0  0.3  14520  6520 ?        Ss   {boot}   0:00 /usr/sbin/sshd -D"
        ))
        .await?;
        out.println(&format!(
            "root        {}  0.0  0.1  12340  4320 pts/0    Ss   {now}   0:00 -bash",
            ctx.pid
        ))
        .await?;
        out.println(&format!(
            "root        {}  0.0  0.0   9820  3210 pts/0    R+   {now}   0:00 ps aux",
            ctx.pid + 10
        ))
        .await?;
        Ok(EXIT_OK)
    }
}

pub struct WhoamiCommand;

#[async_trait]
impl Command for WhoamiCommand {
    fn name(&self) -> &'static str {
        "whoami"
    }

    async fn run(
        &self,
        _args: &[String],
        _input: &mut CmdIn,
        out: &mut CmdOut<'_>,
        ctx: &CommandContext,
    ) -> io::Result<i32> {
        out.println(&ctx.user()).await?;
        Ok(EXIT_OK)
    }
}

pub struct IdCommand;

#[async_trait]
impl Command for IdCommand {
    fn name(&self) -> &'static str {
        "id"
    }

    async fn run(
        &self,
        _args: &[String],
        _input: &mut CmdIn,
        out: &mut CmdOut<'_>,
        ctx: &CommandContext,
    ) -> io::Result<i32> {
        let u = ctx.user();
        let uid = base().uid_of(&u).unwrap_or(0);
        let gid = base().gid_of(&u).unwrap_or(0);
        out.println(&format!(
            "uid={uid}({u}) gid={gid}({u}) groups={gid}({u})"
        ))
        .await?;
        Ok(EXIT_OK)
    }
}

pub struct DateCommand;

#[async_trait]
impl Command for DateCommand {
    fn name(&self) -> &'static str {
        "date"
    }

    async fn run(
        &self,
        _args: &[String],
        _input: &mut CmdIn,
        out: &mut CmdOut<'_>,
        _ctx: &CommandContext,
    ) -> io::Result<i32> {
        out.println(&Local::now().format("%a %b %e %H:%M:%S %Y").to_string())
            .await?;
        Ok(EXIT_OK)
    }
}

pub struct UptimeCommand;

#[async_trait]
impl Command for UptimeCommand {
    fn name(&self) -> &'static str {
        "uptime"
    }

    async fn run(
        &self,
        _args: &[String],
        _input: &mut CmdIn,
        out: &mut CmdOut<'_>,
        _ctx: &CommandContext,
    ) -> io::Result<i32> {
        let mins = (Local::now() - base().booted).num_minutes();
        out.println(&format!(
            " {} up {mins} min,  1 user,  load average: 0.00, 0.01, 0.05",
            Local::now().format("%H:%M:%S")
        ))
        .await?;
        Ok(EXIT_OK)
    }
}

pub struct UnameCommand;

#[async_trait]
impl Command for UnameCommand {
    fn name(&self) -> &'static str {
        "uname"
    }

    async fn run(
        &self,
        args: &[String],
        _input: &mut CmdIn,
        out: &mut CmdOut<'_>,
        _ctx: &CommandContext,
    ) -> io::Result<i32> {
        if args.get(1).is_some_and(|a| a == "-a") {
            out.println("Linux ubuntu-server 5.15.0-generic #1 SMP Fri Jan 1 00:00:00 UTC 2022 x86_64 x86_64 x86_64 GNU/Linux")
                .await?;
        } else {
            out.println("Linux").await?;
        }
        Ok(EXIT_OK)
    }
}

pub struct FreeCommand;

#[async_trait]
impl Command for FreeCommand {
    fn name(&self) -> &'static str {
        "free"
    }

    async fn run(
        &self,
        _args: &[String],
        _input: &mut CmdIn,
        out: &mut CmdOut<'_>,
        _ctx: &CommandContext,
    ) -> io::Result<i32> {
        out.println("              total        used        free      shared  buff/cache   available")
            .await?;
        out.println("Mem:       16303284     1024512     2543210        1234    12735562    15000000")
            .await?;
        out.println("Swap:       2097148           0     2097148").await?;
        Ok(EXIT_OK)
    }
}

pub struct DfCommand;

#[async_trait]
impl Command for DfCommand {
    fn name(&self) -> &'static str {
        "df"
    }

    async fn run(
        &self,
        _args: &[String],
        _input: &mut CmdIn,
        out: &mut CmdOut<'_>,
        _ctx: &CommandContext,
    ) -> io::Result<i32> {
        out.println("Filesystem      1K-blocks      Used Available Use% Mounted on")
            .await?;
        out.println("/dev/sda2       102400000   5242880  97157120   6% /")
            .await?;
        out.println("tmpfs             1630328         0   1630328   0% /run/user/0")
            .await?;
        Ok(EXIT_OK)
    }
}

pub struct NetstatCommand;

#[async_trait]
impl Command for NetstatCommand {
    fn name(&self) -> &'static str {
        "netstat"
    }

    fn aliases(&self) -> Vec<&'static str> {
        vec!["ss"]
    }

    async fn run(
        &self,
        _args: &[String],
        _input: &mut CmdIn,
        out: &mut CmdOut<'_>,
        _ctx: &CommandContext,
    ) -> io::Result<i32> {
        out.println("Active Internet connections (w/o servers)").await?;
        out.println("Proto Recv-Q Send-Q Local Address           Foreign Address         State")
            .await?;
        out.println("tcp        0     64 192.168.1.10:22         192.168.1.5:5678        ESTABLISHED")
            .await?;
        Ok(EXIT_OK)
    }
}

pub struct ClearCommand;

#[async_trait]
impl Command for ClearCommand {
    fn name(&self) -> &'static str {
        "clear"
    }

    async fn run(
        &self,
        _args: &[String],
        _input: &mut CmdIn,
        out: &mut CmdOut<'_>,
        _ctx: &CommandContext,
    ) -> io::Result<i32> {
        out.write_all(b"\x1b[H\x1b[2J").await?;
        Ok(EXIT_OK)
    }
}

pub struct ExitCommand;

#[async_trait]
impl Command for ExitCommand {
    fn name(&self) -> &'static str {
        "exit"
    }

    fn aliases(&self) -> Vec<&'static str> {
        vec!["logout"]
    }

    async fn run(
        &self,
        _args: &[String],
        _input: &mut CmdIn,
        _out: &mut CmdOut<'_>,
        ctx: &CommandContext,
    ) -> io::Result<i32> {
        ctx.running.store(false, Ordering::SeqCst);
        Ok(EXIT_OK)
    }
}

pub struct SleepCommand;

#[async_trait]
impl Command for SleepCommand {
    fn name(&self) -> &'static str {
        "sleep"
    }

    async fn run(
        &self,
        args: &[String],
        _input: &mut CmdIn,
        _out: &mut CmdOut<'_>,
        _ctx: &CommandContext,
    ) -> io::Result<i32> {
        if let Some(arg) = args.get(1) {
            if let Ok(secs) = arg.parse::<u64>() {
                // Clamped so nobody parks ten thousand tasks on us.
                tokio::time::sleep(Duration::from_secs(secs.min(5))).await;
            }
        }
        Ok(EXIT_OK)
    }
}

pub struct SudoCommand;

#[async_trait]
impl Command for SudoCommand {
    fn name(&self) -> &'static str {
        "sudo"
    }

    async fn run(
        &self,
        args: &[String],
        input: &mut CmdIn,
        out: &mut CmdOut<'_>,
        ctx: &CommandContext,
    ) -> io::Result<i32> {
        if args.len() > 1 {
            // No privilege model here, just re-dispatch.
            return registry().dispatch(&args[1..], input, out, ctx).await;
        }
        Ok(EXIT_OK)
    }
}

/// `more`/`less`, simplified to `cat`.
pub struct PagerCommand;

#[async_trait]
impl Command for PagerCommand {
    fn name(&self) -> &'static str {
        "more"
    }

    fn aliases(&self) -> Vec<&'static str> {
        vec!["less"]
    }

    async fn run(
        &self,
        args: &[String],
        input: &mut CmdIn,
        out: &mut CmdOut<'_>,
        ctx: &CommandContext,
    ) -> io::Result<i32> {
        if args.len() > 1 {
            let mut argv = vec!["cat".to_string()];
            argv.extend_from_slice(&args[1..]);
            return registry().dispatch(&argv, input, out, ctx).await;
        }
        Ok(EXIT_OK)
    }
}

/// Full-screen foreground app. Installs the raw-mode key sink so the
/// input task bypasses the line editor for the app's lifetime.
pub struct KernelPanicCommand;

#[async_trait]
impl Command for KernelPanicCommand {
    fn name(&self) -> &'static str {
        "kernelpanic"
    }

    async fn run(
        &self,
        _args: &[String],
        _input: &mut CmdIn,
        out: &mut CmdOut<'_>,
        ctx: &CommandContext,
    ) -> io::Result<i32> {
        let (tx, rx) = mpsc::unbounded_channel();
        *ctx.raw_keys.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);

        let res = game::run_kernel_panic(out, rx, ctx).await;

        // Dropping the sender on uninstall tears the app's input down.
        *ctx.raw_keys.lock().unwrap_or_else(PoisonError::into_inner) = None;
        res?;
        Ok(EXIT_OK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::pipeline::test_support::{plain_ctx, run_line};

    #[tokio::test]
    async fn test_whoami_reads_env() {
        let ctx = plain_ctx();
        let (out, _) = run_line("whoami", &ctx).await;
        assert_eq!(out, "root\n");
        ctx.env_set("USER".into(), "user".into());
        let (out, _) = run_line("whoami", &ctx).await;
        assert_eq!(out, "user\n");
    }

    #[tokio::test]
    async fn test_id_resolves_ids() {
        let ctx = plain_ctx();
        let (out, _) = run_line("id", &ctx).await;
        assert_eq!(out, "uid=0(root) gid=0(root) groups=0(root)\n");
    }

    #[tokio::test]
    async fn test_ps_interpolates_pid() {
        let ctx = plain_ctx();
        let (out, _) = run_line("ps aux", &ctx).await;
        assert!(out.contains("/sbin/init"));
        assert!(out.contains(&format!("root        {}", ctx.pid)));
    }

    #[tokio::test]
    async fn test_uname_variants() {
        let ctx = plain_ctx();
        let (out, _) = run_line("uname", &ctx).await;
        assert_eq!(out, "Linux\n");
        let (out, _) = run_line("uname -a", &ctx).await;
        assert!(out.contains("ubuntu-server 5.15.0-generic"));
    }

    #[tokio::test]
    async fn test_exit_clears_running() {
        let ctx = plain_ctx();
        assert!(ctx.running.load(Ordering::SeqCst));
        run_line("exit", &ctx).await;
        assert!(!ctx.running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_sudo_redispatches() {
        let ctx = plain_ctx();
        let (out, code) = run_line("sudo whoami", &ctx).await;
        assert_eq!(code, EXIT_OK);
        assert_eq!(out, "root\n");
        let (out, code) = run_line("sudo frobnicate", &ctx).await;
        assert_eq!(code, 127);
        assert!(out.contains("未找到命令"));
    }

    #[tokio::test]
    async fn test_pager_is_cat() {
        let ctx = plain_ctx();
        let (out, _) = run_line("less /etc/hostname", &ctx).await;
        assert_eq!(out, "ubuntu-server\n");
    }

    #[tokio::test]
    async fn test_clear_emits_ansi() {
        let ctx = plain_ctx();
        let (out, _) = run_line("clear", &ctx).await;
        assert_eq!(out, "\x1b[H\x1b[2J");
    }
}
