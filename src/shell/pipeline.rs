//! Command-line execution: tokenization, redirection, environment
//! expansion, and the staged pipeline runner.
//!
//! Stages of a multi-command pipeline run as their own tasks connected by
//! in-memory byte pipes. Each spawned stage owns the write half of its
//! downstream pipe, so finishing the task (on any path) closes the pipe
//! and the next stage observes EOF. The final stage runs inline and is the
//! only writer to the terminal.

use std::io;
use std::sync::atomic::Ordering;

use tokio::io::{simplex, AsyncWriteExt};

use super::commands::{registry, CmdIn, CmdOut, CommandContext};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Split a command line on unquoted whitespace. Single- and double-quoted
/// spans are literal; there is no escape character, and an unterminated
/// quote just runs to the end of the line. Unquoted `>`/`>>` are emitted
/// as their own tokens even when glued to surrounding text, so
/// `echo hi>/tmp/x` redirects the same way `echo hi > /tmp/x` does.
pub fn parse_args(cmdline: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut buf = String::new();
    let mut in_quote = false;
    let mut quote_char = ' ';
    let mut chars = cmdline.chars().peekable();

    while let Some(r) = chars.next() {
        match r {
            '"' | '\'' => {
                if !in_quote {
                    in_quote = true;
                    quote_char = r;
                } else if r == quote_char {
                    in_quote = false;
                } else {
                    buf.push(r);
                }
            }
            ' ' | '\t' if !in_quote => {
                if !buf.is_empty() {
                    args.push(std::mem::take(&mut buf));
                }
            }
            '>' if !in_quote => {
                if !buf.is_empty() {
                    args.push(std::mem::take(&mut buf));
                }
                if chars.peek() == Some(&'>') {
                    chars.next();
                    args.push(">>".to_string());
                } else {
                    args.push(">".to_string());
                }
            }
            _ => buf.push(r),
        }
    }
    if !buf.is_empty() {
        args.push(buf);
    }
    args
}

/// `$NAME` tokens become their environment value; `$?` is the last exit
/// code and `$$` the session PID. The command name itself is never
/// expanded, and only whole tokens expand — `$FOO` glued to other text
/// passes through untouched. Positional parameters do not exist here.
fn expand_args(args: &mut [String], ctx: &CommandContext) {
    for arg in args.iter_mut().skip(1) {
        if let Some(var) = arg.strip_prefix('$') {
            if let Some(val) = ctx.env_get(var) {
                *arg = val;
            } else if var == "?" {
                *arg = ctx.last_exit.load(Ordering::SeqCst).to_string();
            } else if var == "$" {
                *arg = ctx.pid.to_string();
            }
        }
    }
}

/// Execute one full command line against `final_out`.
///
/// When a `>`/`>>` token is present, the whole pipeline's output is
/// collected into a buffer and written to the session filesystem instead
/// (append is simplified to overwrite). `$?` is updated from the stages.
pub async fn exec_line(
    ctx: &CommandContext,
    cmdline: &str,
    final_out: &mut CmdOut<'_>,
) -> io::Result<()> {
    ctx.last_exit.store(0, Ordering::SeqCst);

    let tokens = parse_args(cmdline);
    let mut effective = cmdline.to_string();
    let mut redirect: Option<String> = None;
    for (i, tok) in tokens.iter().enumerate() {
        if (tok == ">" || tok == ">>") && i + 1 < tokens.len() {
            redirect = Some(ctx.fs.abs(&tokens[i + 1]));
            effective = tokens[..i].join(" ");
            break;
        }
    }

    match redirect {
        Some(path) => {
            let mut buf = std::io::Cursor::new(Vec::new());
            {
                let mut out = CmdOut::pipe(&mut buf);
                run_pipeline(ctx, &effective, &mut out).await?;
            }
            let _ = ctx.fs.write(&path, buf.into_inner(), Some(0o644));
            Ok(())
        }
        None => run_pipeline(ctx, &effective, final_out).await,
    }
}

async fn run_pipeline(
    ctx: &CommandContext,
    cmdline: &str,
    final_out: &mut CmdOut<'_>,
) -> io::Result<()> {
    let mut stages: Vec<Vec<String>> = cmdline
        .split('|')
        .map(parse_args)
        .filter(|args| !args.is_empty())
        .collect();
    if stages.is_empty() {
        return Ok(());
    }
    for stage in &mut stages {
        expand_args(stage, ctx);
    }

    if stages.len() == 1 {
        let mut input = CmdIn::empty();
        let code = registry()
            .dispatch(&stages[0], &mut input, final_out, ctx)
            .await?;
        if code != 0 {
            ctx.last_exit.store(code, Ordering::SeqCst);
        }
        return Ok(());
    }

    let last = stages.len() - 1;
    let mut handles = Vec::with_capacity(last);
    let mut upstream = CmdIn::empty();

    for (i, args) in stages.into_iter().enumerate() {
        if i < last {
            let (rd, wr) = simplex(PIPE_CAPACITY);
            let input = std::mem::replace(&mut upstream, CmdIn::new(Box::new(rd)));
            let stage_ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                let mut input = input;
                let mut wr = wr;
                let result = {
                    let mut out = CmdOut::pipe(&mut wr);
                    registry().dispatch(&args, &mut input, &mut out, &stage_ctx).await
                };
                let _ = wr.shutdown().await;
                // A stage whose downstream vanished has nothing to report;
                // real failures still land in $?.
                if let Ok(code) = result {
                    if code != 0 {
                        stage_ctx.last_exit.store(code, Ordering::SeqCst);
                    }
                }
                // wr drops here: downstream sees EOF on every return path.
            }));
        } else {
            let mut input = std::mem::replace(&mut upstream, CmdIn::empty());
            let code = registry().dispatch(&args, &mut input, final_out, ctx).await?;
            if code != 0 {
                ctx.last_exit.store(code, Ordering::SeqCst);
            }
            // Dropping our read end unblocks any upstream still writing.
            drop(input);
        }
    }

    for h in handles {
        let _ = h.await;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
    use std::sync::{Arc, Mutex};

    use super::super::commands::{CmdOut, CommandContext};
    use super::super::filesystem::session::SessionFs;
    use super::super::WinSize;

    pub fn plain_ctx() -> CommandContext {
        let mut env = HashMap::new();
        env.insert("USER".to_string(), "root".to_string());
        env.insert("HOME".to_string(), "/root".to_string());
        env.insert("SHELL".to_string(), "/bin/bash".to_string());
        env.insert("TERM".to_string(), "xterm-256color".to_string());
        CommandContext {
            fs: SessionFs::new(),
            env: Arc::new(Mutex::new(env)),
            history: Arc::new(Mutex::new(Vec::new())),
            size: Arc::new(Mutex::new(WinSize::default())),
            raw_keys: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(true)),
            last_exit: Arc::new(AtomicI32::new(0)),
            pid: 4242,
        }
    }

    /// Run a command line with a plain (non-tty) capture sink; returns the
    /// produced output and the resulting `$?`.
    pub async fn run_line(line: &str, ctx: &CommandContext) -> (String, i32) {
        let mut buf = std::io::Cursor::new(Vec::new());
        {
            let mut out = CmdOut::pipe(&mut buf);
            super::exec_line(ctx, line, &mut out).await.unwrap();
        }
        (
            String::from_utf8_lossy(buf.get_ref()).into_owned(),
            ctx.last_exit.load(Ordering::SeqCst),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::test_support::{plain_ctx, run_line};
    use super::*;

    #[test]
    fn test_parse_args_plain() {
        assert_eq!(parse_args("ls -la /tmp"), vec!["ls", "-la", "/tmp"]);
        assert_eq!(parse_args("  spaced   out  "), vec!["spaced", "out"]);
        assert!(parse_args("").is_empty());
    }

    #[test]
    fn test_parse_args_quotes() {
        assert_eq!(parse_args("echo 'a b' c"), vec!["echo", "a b", "c"]);
        assert_eq!(parse_args("echo \"x 'y' z\""), vec!["echo", "x 'y' z"]);
        // Unterminated quotes run to end of line.
        assert_eq!(parse_args("echo 'open end"), vec!["echo", "open end"]);
    }

    #[test]
    fn test_parse_args_mixed_quote_chars() {
        assert_eq!(parse_args("grep \"it's\" f"), vec!["grep", "it's", "f"]);
    }

    #[test]
    fn test_parse_args_glued_redirection() {
        assert_eq!(
            parse_args("echo hi>/tmp/x"),
            vec!["echo", "hi", ">", "/tmp/x"]
        );
        assert_eq!(parse_args("echo hi>>log"), vec!["echo", "hi", ">>", "log"]);
        assert_eq!(parse_args("echo a > b"), vec!["echo", "a", ">", "b"]);
        // Quoted '>' stays inside its token.
        assert_eq!(parse_args("cat 'a>b'"), vec!["cat", "a>b"]);
    }

    #[tokio::test]
    async fn test_pipeline_passwd_grep_wc() {
        let ctx = plain_ctx();
        let (out, code) = run_line("cat /etc/passwd | grep root | wc", &ctx).await;
        assert_eq!(code, 0);
        assert_eq!(out, "1\n");
    }

    #[tokio::test]
    async fn test_pipeline_empty_stages_dropped() {
        let ctx = plain_ctx();
        let (out, _) = run_line("echo ok | | cat", &ctx).await;
        assert_eq!(out, "ok\n");
    }

    #[tokio::test]
    async fn test_redirect_then_read_back() {
        let ctx = plain_ctx();
        run_line("echo hello > /etc/hosts", &ctx).await;
        let (out, _) = run_line("cat /etc/hosts", &ctx).await;
        assert_eq!(out, "hello\n");
        // Another session still sees the canonical file.
        let other = plain_ctx();
        let (out, _) = run_line("cat /etc/hosts", &other).await;
        assert_eq!(out, "127.0.0.1 localhost\n127.0.1.1 ubuntu-server\n");
    }

    #[tokio::test]
    async fn test_redirect_without_surrounding_spaces() {
        let ctx = plain_ctx();
        let (out, _) = run_line("echo hi>/tmp/glued", &ctx).await;
        assert!(out.is_empty());
        assert_eq!(ctx.fs.entry("/tmp/glued").unwrap().content(), b"hi\n");
    }

    #[tokio::test]
    async fn test_redirect_of_pipeline_output() {
        let ctx = plain_ctx();
        run_line("cat /etc/passwd | grep root > /tmp/hits", &ctx).await;
        let hits = ctx.fs.entry("/tmp/hits").unwrap().content();
        assert_eq!(
            String::from_utf8_lossy(&hits),
            "root:x:0:0:root:/root:/bin/bash\n"
        );
    }

    #[tokio::test]
    async fn test_exit_code_expansion() {
        let ctx = plain_ctx();
        run_line("frobnicate", &ctx).await;
        let (out, _) = run_line("echo $?", &ctx).await;
        assert_eq!(out, "127\n");
        let (out, _) = run_line("echo $$", &ctx).await;
        assert_eq!(out, "4242\n");
        let (out, _) = run_line("echo $USER", &ctx).await;
        assert_eq!(out, "root\n");
    }

    #[tokio::test]
    async fn test_failed_stage_sets_exit_code() {
        let ctx = plain_ctx();
        let (_, code) = run_line("cat /missing | wc", &ctx).await;
        assert_eq!(code, 1);
    }

    #[tokio::test]
    async fn test_stream_liveness_oversized_upstream() {
        let ctx = plain_ctx();
        // Well past the pipe capacity so a deadlocked upstream would hang.
        let line = "payload-line\n".repeat(40_000);
        ctx.fs
            .write("/tmp/big", line.into_bytes(), None)
            .unwrap();

        let fut = run_line("cat /tmp/big | head -n 1", &ctx);
        let (out, _) = tokio::time::timeout(Duration::from_secs(5), fut)
            .await
            .expect("pipeline must terminate promptly");
        assert_eq!(out, "payload-line\n");
    }

    #[tokio::test]
    async fn test_three_stage_streaming() {
        let ctx = plain_ctx();
        run_line("echo alpha > /tmp/w", &ctx).await;
        let (out, _) = run_line("cat /tmp/w | cat | cat", &ctx).await;
        assert_eq!(out, "alpha\n");
    }
}
