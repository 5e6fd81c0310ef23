//! Text and stream processing commands. These are the ones that sit in
//! the middle of pipelines, so they all read line-by-line.

use std::collections::VecDeque;
use std::io;
use std::sync::PoisonError;

use async_trait::async_trait;

use super::command_trait::{CmdIn, CmdOut, Command, EXIT_OK, EXIT_USAGE};
use super::context::CommandContext;
use super::{COLOR_FILE_TAG, COLOR_MATCH, COLOR_RESET};

pub struct EchoCommand;

#[async_trait]
impl Command for EchoCommand {
    fn name(&self) -> &'static str {
        "echo"
    }

    async fn run(
        &self,
        args: &[String],
        _input: &mut CmdIn,
        out: &mut CmdOut<'_>,
        _ctx: &CommandContext,
    ) -> io::Result<i32> {
        out.println(&args[1..].join(" ")).await?;
        Ok(EXIT_OK)
    }
}

pub struct GrepCommand;

impl GrepCommand {
    async fn emit(
        out: &mut CmdOut<'_>,
        line: &str,
        pattern: &str,
        fname: Option<&str>,
        use_color: bool,
        invert: bool,
    ) -> io::Result<()> {
        if line.contains(pattern) == invert {
            return Ok(());
        }
        let prefix = match fname {
            Some(f) if use_color => format!("{COLOR_FILE_TAG}{f}{COLOR_RESET}:"),
            Some(f) => format!("{f}:"),
            None => String::new(),
        };
        // Inverted output has no match to highlight.
        let body = if use_color && !invert {
            line.replace(pattern, &format!("{COLOR_MATCH}{pattern}{COLOR_RESET}"))
        } else {
            line.to_string()
        };
        out.println(&format!("{prefix}{body}")).await
    }
}

#[async_trait]
impl Command for GrepCommand {
    fn name(&self) -> &'static str {
        "grep"
    }

    async fn run(
        &self,
        args: &[String],
        input: &mut CmdIn,
        out: &mut CmdOut<'_>,
        ctx: &CommandContext,
    ) -> io::Result<i32> {
        if args.len() < 2 {
            return Ok(EXIT_OK);
        }
        let mut rest = &args[1..];
        let mut invert = false;
        // One leading flag is allowed: -v inverts, anything else is
        // refused outright so no flag ever silently changes meaning.
        if let Some(flag) = rest[0].strip_prefix('-') {
            if rest[0] == "-v" {
                invert = true;
            } else {
                out.println(&format!("grep: 无效选项 -- '{flag}'")).await?;
                return Ok(EXIT_USAGE);
            }
            rest = &rest[1..];
            if rest.is_empty() {
                return Ok(EXIT_OK);
            }
        }
        let pattern = rest[0].clone();
        let files: Vec<String> = rest[1..].to_vec();
        let use_color = out.is_tty();
        let tag_files = files.len() > 1;

        if files.is_empty() {
            // Line scanner, never read-all: the upstream may be unbounded.
            while let Some(line) = input.next_line().await? {
                Self::emit(out, &line, &pattern, None, use_color, invert).await?;
            }
        } else {
            for f in &files {
                match ctx.fs.entry(&ctx.fs.abs(f)) {
                    Some(e) if !e.is_dir => {
                        let content = e.content();
                        for line in String::from_utf8_lossy(&content).lines() {
                            let tag = tag_files.then_some(f.as_str());
                            Self::emit(out, line, &pattern, tag, use_color, invert).await?;
                        }
                    }
                    _ => {
                        out.println(&format!("grep: {f}: 没有那个文件或目录")).await?;
                    }
                }
            }
        }
        Ok(EXIT_OK)
    }
}

fn parse_limit_and_files(args: &[String]) -> (usize, Vec<String>) {
    let mut limit = 10usize;
    let mut files = Vec::new();
    let mut i = 1;
    while i < args.len() {
        if args[i] == "-n" && i + 1 < args.len() {
            limit = args[i + 1].parse().unwrap_or(0);
            i += 2;
        } else {
            files.push(args[i].clone());
            i += 1;
        }
    }
    (limit, files)
}

async fn print_file_lines(
    out: &mut CmdOut<'_>,
    content: &[u8],
    head: bool,
    limit: usize,
) -> io::Result<()> {
    let text = String::from_utf8_lossy(content);
    let lines: Vec<&str> = text.lines().collect();
    let (start, end) = if head {
        (0, limit.min(lines.len()))
    } else {
        (lines.len().saturating_sub(limit), lines.len())
    };
    for line in &lines[start..end] {
        out.println(line).await?;
    }
    Ok(())
}

async fn head_tail_files(
    out: &mut CmdOut<'_>,
    ctx: &CommandContext,
    files: &[String],
    head: bool,
    limit: usize,
) -> io::Result<()> {
    for f in files {
        if files.len() > 1 {
            out.println(&format!("==> {f} <==")).await?;
        }
        if let Some(e) = ctx.fs.entry(&ctx.fs.abs(f)) {
            print_file_lines(out, &e.content(), head, limit).await?;
        }
    }
    Ok(())
}

pub struct HeadCommand;

#[async_trait]
impl Command for HeadCommand {
    fn name(&self) -> &'static str {
        "head"
    }

    async fn run(
        &self,
        args: &[String],
        input: &mut CmdIn,
        out: &mut CmdOut<'_>,
        ctx: &CommandContext,
    ) -> io::Result<i32> {
        let (limit, files) = parse_limit_and_files(args);
        if files.is_empty() {
            // Stop reading once we have enough; the upstream sees the pipe
            // close and unwinds.
            let mut taken = 0;
            while taken < limit {
                match input.next_line().await? {
                    Some(line) => {
                        out.println(&line).await?;
                        taken += 1;
                    }
                    None => break,
                }
            }
        } else {
            head_tail_files(out, ctx, &files, true, limit).await?;
        }
        Ok(EXIT_OK)
    }
}

pub struct TailCommand;

#[async_trait]
impl Command for TailCommand {
    fn name(&self) -> &'static str {
        "tail"
    }

    async fn run(
        &self,
        args: &[String],
        input: &mut CmdIn,
        out: &mut CmdOut<'_>,
        ctx: &CommandContext,
    ) -> io::Result<i32> {
        let (limit, files) = parse_limit_and_files(args);
        if files.is_empty() {
            let mut window: VecDeque<String> = VecDeque::with_capacity(limit);
            while let Some(line) = input.next_line().await? {
                if window.len() == limit && limit > 0 {
                    window.pop_front();
                }
                if limit > 0 {
                    window.push_back(line);
                }
            }
            for line in &window {
                out.println(line).await?;
            }
        } else {
            head_tail_files(out, ctx, &files, false, limit).await?;
        }
        Ok(EXIT_OK)
    }
}

pub struct WcCommand;

#[async_trait]
impl Command for WcCommand {
    fn name(&self) -> &'static str {
        "wc"
    }

    async fn run(
        &self,
        args: &[String],
        input: &mut CmdIn,
        out: &mut CmdOut<'_>,
        ctx: &CommandContext,
    ) -> io::Result<i32> {
        if args.len() == 1 {
            let mut count = 0u64;
            while input.next_line().await?.is_some() {
                count += 1;
            }
            out.println(&count.to_string()).await?;
        } else {
            for f in &args[1..] {
                if let Some(e) = ctx.fs.entry(&ctx.fs.abs(f)) {
                    let content = e.content();
                    let count = String::from_utf8_lossy(&content).lines().count();
                    out.println(&format!("{count} {f}")).await?;
                }
            }
        }
        Ok(EXIT_OK)
    }
}

pub struct HistoryCommand;

#[async_trait]
impl Command for HistoryCommand {
    fn name(&self) -> &'static str {
        "history"
    }

    async fn run(
        &self,
        _args: &[String],
        _input: &mut CmdIn,
        out: &mut CmdOut<'_>,
        ctx: &CommandContext,
    ) -> io::Result<i32> {
        let entries = ctx
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for (i, h) in entries.iter().enumerate() {
            out.println(&format!("{:5}  {}", i + 1, h)).await?;
        }
        Ok(EXIT_OK)
    }
}

pub struct ExportCommand;

#[async_trait]
impl Command for ExportCommand {
    fn name(&self) -> &'static str {
        "export"
    }

    async fn run(
        &self,
        args: &[String],
        _input: &mut CmdIn,
        out: &mut CmdOut<'_>,
        ctx: &CommandContext,
    ) -> io::Result<i32> {
        if args.len() == 1 {
            let mut vars: Vec<(String, String)> = ctx.env_snapshot().into_iter().collect();
            vars.sort();
            for (k, v) in vars {
                out.println(&format!("declare -x {k}=\"{v}\"")).await?;
            }
        } else {
            for kv in &args[1..] {
                if let Some((k, v)) = kv.split_once('=') {
                    ctx.env_set(k.to_string(), v.to_string());
                }
            }
        }
        Ok(EXIT_OK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::pipeline::test_support::{plain_ctx, run_line};

    #[tokio::test]
    async fn test_echo_joins_args() {
        let ctx = plain_ctx();
        let (out, code) = run_line("echo hello   world", &ctx).await;
        assert_eq!(code, EXIT_OK);
        assert_eq!(out, "hello world\n");
    }

    #[tokio::test]
    async fn test_echo_quoting_preserves_spaces() {
        let ctx = plain_ctx();
        let (out, _) = run_line("echo 'a  b' \"c  d\"", &ctx).await;
        assert_eq!(out, "a  b c  d\n");
    }

    #[tokio::test]
    async fn test_grep_file_match() {
        let ctx = plain_ctx();
        let (out, _) = run_line("grep root /etc/passwd", &ctx).await;
        assert_eq!(out, "root:x:0:0:root:/root:/bin/bash\n");
    }

    #[tokio::test]
    async fn test_grep_missing_file() {
        let ctx = plain_ctx();
        let (out, _) = run_line("grep x /missing", &ctx).await;
        assert!(out.contains("grep: /missing: 没有那个文件或目录"));
    }

    #[tokio::test]
    async fn test_grep_v_inverts_match() {
        let ctx = plain_ctx();
        let (out, code) = run_line("grep -v root /etc/passwd", &ctx).await;
        assert_eq!(code, EXIT_OK);
        // passwd has 13 lines and exactly one contains "root".
        assert_eq!(out.lines().count(), 12);
        assert!(!out.contains("root"));
        assert!(out.contains("daemon:x:1:1"));
    }

    #[tokio::test]
    async fn test_grep_rejects_unknown_flag() {
        let ctx = plain_ctx();
        let (out, code) = run_line("grep -i root /etc/passwd", &ctx).await;
        assert_eq!(code, EXIT_USAGE);
        assert_eq!(out, "grep: 无效选项 -- 'i'\n");
    }

    #[tokio::test]
    async fn test_head_tail_on_file() {
        let ctx = plain_ctx();
        let (out, _) = run_line("head -n 2 /etc/passwd", &ctx).await;
        assert_eq!(out.lines().count(), 2);
        assert!(out.starts_with("root:"));

        let (out, _) = run_line("tail -n 1 /etc/passwd", &ctx).await;
        assert_eq!(out, "user:x:1000:1000:user:/home/user:/bin/bash\n");
    }

    #[tokio::test]
    async fn test_wc_counts_lines() {
        let ctx = plain_ctx();
        let (out, _) = run_line("wc /etc/group", &ctx).await;
        assert_eq!(out, "13 /etc/group\n");
    }

    #[tokio::test]
    async fn test_export_and_expansion() {
        let ctx = plain_ctx();
        run_line("export FLAG=pwned", &ctx).await;
        let (out, _) = run_line("echo $FLAG", &ctx).await;
        assert_eq!(out, "pwned\n");
        let (listing, _) = run_line("export", &ctx).await;
        assert!(listing.contains("declare -x FLAG=\"pwned\""));
    }
}
