//! The pseudo-shell terminal: a line editor speaking raw-terminal bytes
//! over whatever stream a protocol front-end hands it.
//!
//! A dedicated input task pulls decoded runes off the stream into a
//! bounded key channel, so a foreground command stuck in a render loop
//! never blocks keyboard handling. When a foreground app has installed
//! the raw-mode sink, keys bypass the editor entirely.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::commands::{CmdOut, CommandContext};
use super::filesystem::session::SessionFs;
use super::pipeline;
use super::WinSize;

const HOSTNAME: &str = "ubuntu-server";
const HISTORY_CAP: usize = 100;
const KEY_CHANNEL_CAP: usize = 128;
/// How long a bare ESC may wait for a CSI follow-up before it is treated
/// as a lone keypress.
const ESC_TIMEOUT: Duration = Duration::from_millis(100);

/// Writer that converts bare `\n` into `\r\n`; the streams underneath are
/// raw terminals, and a lone `\n` produces the staircase effect.
pub struct CrlfWriter<W> {
    inner: W,
    pending: Vec<u8>,
    pos: usize,
    consumed: usize,
}

impl<W: AsyncWrite + Unpin> CrlfWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            pending: Vec::new(),
            pos: 0,
            consumed: 0,
        }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CrlfWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.pos >= this.pending.len() {
            this.pending.clear();
            this.pos = 0;
            for &b in buf {
                if b == b'\n' {
                    this.pending.extend_from_slice(b"\r\n");
                } else {
                    this.pending.push(b);
                }
            }
            this.consumed = buf.len();
        }
        while this.pos < this.pending.len() {
            match Pin::new(&mut this.inner).poll_write(cx, &this.pending[this.pos..]) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(n)) => this.pos += n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(this.consumed))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Incremental UTF-8 rune decoder over a byte stream. Malformed bytes
/// come out as U+FFFD instead of killing the session.
struct RuneReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> RuneReader<R> {
    async fn next(&mut self) -> Option<char> {
        let mut first = [0u8; 1];
        if self.inner.read_exact(&mut first).await.is_err() {
            return None;
        }
        let b = first[0];
        if b < 0x80 {
            return Some(b as char);
        }
        let extra = match b {
            0xC0..=0xDF => 1,
            0xE0..=0xEF => 2,
            0xF0..=0xF7 => 3,
            _ => return Some(char::REPLACEMENT_CHARACTER),
        };
        let mut buf = [0u8; 4];
        buf[0] = b;
        if self.inner.read_exact(&mut buf[1..=extra]).await.is_err() {
            return None;
        }
        match std::str::from_utf8(&buf[..=extra]) {
            Ok(s) => s.chars().next(),
            Err(_) => Some(char::REPLACEMENT_CHARACTER),
        }
    }
}

pub struct Terminal {
    out: CrlfWriter<Box<dyn AsyncWrite + Send + Unpin>>,
    keys: mpsc::Receiver<char>,
    ctx: CommandContext,
    buffer: Vec<char>,
    cursor: usize,
}

impl Terminal {
    /// Build a terminal over a raw byte stream and spawn its input task.
    /// `env` and `size` are shared with the front-end, which keeps feeding
    /// resize and environment updates after the terminal exists.
    pub fn new<S>(
        stream: S,
        fs: Arc<SessionFs>,
        env: Arc<Mutex<HashMap<String, String>>>,
        size: Arc<Mutex<WinSize>>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (rd, wr) = tokio::io::split(stream);
        let raw_keys: Arc<Mutex<Option<mpsc::UnboundedSender<char>>>> =
            Arc::new(Mutex::new(None));
        let running = Arc::new(AtomicBool::new(true));
        let (key_tx, key_rx) = mpsc::channel(KEY_CHANNEL_CAP);
        tokio::spawn(input_loop(rd, key_tx, raw_keys.clone(), running.clone()));

        let ctx = CommandContext {
            fs,
            env,
            history: Arc::new(Mutex::new(Vec::new())),
            size,
            raw_keys,
            running,
            last_exit: Arc::new(AtomicI32::new(0)),
            pid: 1000 + rand::rng().random_range(0..20000),
        };

        Self {
            out: CrlfWriter::new(Box::new(wr)),
            keys: key_rx,
            ctx,
            buffer: Vec::with_capacity(1024),
            cursor: 0,
        }
    }

    /// Interactive shell loop. Returns when the peer disconnects, sends
    /// Ctrl-D on an empty line, or runs exit/logout.
    pub async fn run(mut self) {
        let _ = self.run_inner().await;
        self.ctx.running.store(false, Ordering::SeqCst);
        let _ = self.out.shutdown().await;
    }

    /// Run a single command line (SSH exec mode): no banner, no prompt.
    pub async fn exec(mut self, cmdline: &str) {
        let ctx = self.ctx.clone();
        {
            let mut out = CmdOut::terminal(&mut self.out);
            let _ = pipeline::exec_line(&ctx, cmdline, &mut out).await;
        }
        self.ctx.running.store(false, Ordering::SeqCst);
        let _ = self.out.flush().await;
    }

    async fn run_inner(&mut self) -> io::Result<()> {
        self.write(b"Welcome to Ubuntu 22.04 LTS (GNU/Linux 5.15.0-generic x86_64)\n")
            .await?;
        self.write(b" * Documentation:  https://help.ubuntu.com\n").await?;
        self.write(b" * Management:     https://landscape.canonical.com\n")
            .await?;
        self.write(b" * Support:        https://ubuntu.com/advantage\n\n")
            .await?;
        self.prompt().await?;

        let mut hist_idx: i64 = -1;
        let mut esc: u8 = 0;

        loop {
            let key = if esc == 1 {
                match timeout(ESC_TIMEOUT, self.keys.recv()).await {
                    Ok(k) => k,
                    Err(_) => {
                        // Lone ESC: swallow it.
                        esc = 0;
                        continue;
                    }
                }
            } else {
                self.keys.recv().await
            };
            let Some(r) = key else { break };

            if esc == 0 {
                if r == '\x1b' {
                    esc = 1;
                    continue;
                }
            } else if esc == 1 {
                if r == '[' {
                    esc = 2;
                    continue;
                }
                esc = 0;
            } else {
                esc = 0;
                match r {
                    'A' => {
                        let history = self.history_snapshot();
                        if !history.is_empty() {
                            if hist_idx == -1 {
                                hist_idx = history.len() as i64;
                            }
                            if hist_idx > 0 {
                                hist_idx -= 1;
                                self.buffer = history[hist_idx as usize].chars().collect();
                                self.cursor = self.buffer.len();
                                self.clear_line().await?;
                                self.prompt().await?;
                            }
                        }
                    }
                    'B' => {
                        let history = self.history_snapshot();
                        if hist_idx < history.len() as i64 {
                            hist_idx += 1;
                            if hist_idx >= history.len() as i64 {
                                hist_idx = history.len() as i64;
                                self.buffer.clear();
                            } else {
                                self.buffer = history[hist_idx as usize].chars().collect();
                            }
                            self.cursor = self.buffer.len();
                            self.clear_line().await?;
                            self.prompt().await?;
                        }
                    }
                    'C' => {
                        if self.cursor < self.buffer.len() {
                            self.cursor += 1;
                            self.write(b"\x1b[C").await?;
                        }
                    }
                    'D' => {
                        if self.cursor > 0 {
                            self.cursor -= 1;
                            self.write(b"\x1b[D").await?;
                        }
                    }
                    _ => {}
                }
                continue;
            }

            match r {
                // Ctrl-C: drop the line, not the session.
                '\x03' => {
                    self.buffer.clear();
                    self.cursor = 0;
                    self.write(b"^C\n").await?;
                    self.prompt().await?;
                }
                // Ctrl-D on an empty line ends the session.
                '\x04' => {
                    if self.buffer.is_empty() {
                        break;
                    }
                }
                '\r' | '\n' => {
                    self.write(b"\n").await?;
                    let cmd: String = self.buffer.iter().collect();
                    if !cmd.trim().is_empty() {
                        self.push_history(&cmd);
                        hist_idx = self.history_snapshot().len() as i64;
                        let ctx = self.ctx.clone();
                        {
                            let mut out = CmdOut::terminal(&mut self.out);
                            pipeline::exec_line(&ctx, &cmd, &mut out).await?;
                        }
                        if !self.ctx.running.load(Ordering::SeqCst) {
                            break;
                        }
                    }
                    self.buffer.clear();
                    self.cursor = 0;
                    self.prompt().await?;
                }
                '\x7f' | '\x08' => {
                    if self.cursor > 0 {
                        self.buffer.remove(self.cursor - 1);
                        self.cursor -= 1;
                        self.clear_line().await?;
                        self.prompt().await?;
                    }
                }
                '\t' => self.autocomplete().await?,
                c if !c.is_control() => {
                    self.buffer.insert(self.cursor, c);
                    self.cursor += 1;
                    if self.cursor == self.buffer.len() {
                        let mut encoded = [0u8; 4];
                        self.write(c.encode_utf8(&mut encoded).as_bytes()).await?;
                    } else {
                        self.clear_line().await?;
                        self.prompt().await?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.out.write_all(bytes).await
    }

    async fn clear_line(&mut self) -> io::Result<()> {
        self.write(b"\r\x1b[K").await
    }

    /// `user@host:dir$ ` with `~` contraction, then the edit buffer, then
    /// the cursor backed up into place.
    async fn prompt(&mut self) -> io::Result<()> {
        let user = self.ctx.user();
        let mut dir = self.ctx.fs.cwd();
        let home = format!("/home/{user}");
        if dir == "/root" || dir == home {
            dir = "~".to_string();
        } else if let Some(rest) = dir.strip_prefix("/root/") {
            dir = format!("~/{rest}");
        } else if let Some(rest) = dir.strip_prefix(&format!("{home}/")) {
            dir = format!("~/{rest}");
        }
        let sign = if user == "root" { "#" } else { "$" };
        let prompt =
            format!("\r\x1b[1;32m{user}@{HOSTNAME}\x1b[0m:\x1b[1;34m{dir}\x1b[0m{sign} ");
        self.write(prompt.as_bytes()).await?;

        let buffer: String = self.buffer.iter().collect();
        self.write(buffer.as_bytes()).await?;
        if self.buffer.len() > self.cursor {
            let back = format!("\x1b[{}D", self.buffer.len() - self.cursor);
            self.write(back.as_bytes()).await?;
        }
        Ok(())
    }

    fn history_snapshot(&self) -> Vec<String> {
        self.ctx
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn push_history(&self, cmd: &str) {
        let mut history = self
            .ctx
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if history.last().map(String::as_str) != Some(cmd) {
            history.push(cmd.to_string());
            if history.len() > HISTORY_CAP {
                history.remove(0);
            }
        }
    }

    /// Tab completion: command names from /bin and /usr/bin at the first
    /// word, directory contents afterwards.
    async fn autocomplete(&mut self) -> io::Result<()> {
        let line: String = self.buffer[..self.cursor].iter().collect();
        let parts: Vec<&str> = line.split_whitespace().collect();
        let last_word = if !parts.is_empty() && !line.ends_with(' ') {
            parts[parts.len() - 1].to_string()
        } else {
            String::new()
        };
        let is_cmd = parts.is_empty() || (parts.len() == 1 && !line.ends_with(' '));

        let mut candidates: Vec<String> = Vec::new();
        if is_cmd {
            for bin in ["/bin", "/usr/bin"] {
                if let Ok(files) = self.ctx.fs.list_dir(bin) {
                    for f in files {
                        if f.name.starts_with(&last_word) {
                            candidates.push(f.name.clone());
                        }
                    }
                }
            }
        } else {
            let (dir_part, file_prefix) = match last_word.rfind('/') {
                Some(i) => (last_word[..=i].to_string(), last_word[i + 1..].to_string()),
                None => (String::new(), last_word.clone()),
            };
            let abs_dir = self.ctx.fs.abs(&dir_part);
            if let Ok(files) = self.ctx.fs.list_dir(&abs_dir) {
                for f in files {
                    if f.name.starts_with(&file_prefix) {
                        let mut name = f.name.clone();
                        if f.is_dir {
                            name.push('/');
                        }
                        candidates.push(format!("{dir_part}{name}"));
                    }
                }
            }
        }
        candidates.sort();
        candidates.dedup();

        if candidates.len() == 1 {
            let completion = candidates[0][last_word.len()..].to_string();
            self.buffer.extend(completion.chars());
            self.cursor += completion.chars().count();
            if !candidates[0].ends_with('/') {
                self.buffer.push(' ');
                self.cursor += 1;
            }
            self.clear_line().await?;
            self.prompt().await?;
        } else if candidates.len() > 1 {
            self.write(b"\n").await?;
            let listing = candidates.join("  ");
            self.write(listing.as_bytes()).await?;
            self.write(b"\n").await?;
            self.prompt().await?;
        }
        Ok(())
    }
}

async fn input_loop<R>(
    rd: R,
    keys: mpsc::Sender<char>,
    raw_keys: Arc<Mutex<Option<mpsc::UnboundedSender<char>>>>,
    running: Arc<AtomicBool>,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut runes = RuneReader { inner: rd };
    while running.load(Ordering::SeqCst) {
        let Some(r) = runes.next().await else { break };
        let forwarded = {
            let guard = raw_keys.lock().unwrap_or_else(PoisonError::into_inner);
            match guard.as_ref() {
                Some(tx) => {
                    // Raw mode: hand the key straight to the foreground
                    // app. A closed receiver just means the app is gone.
                    let _ = tx.send(r);
                    true
                }
                None => false,
            }
        };
        if !forwarded && keys.send(r).await.is_err() {
            break;
        }
    }
    // Dropping the sender closes the key channel and ends the main loop.
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn default_env() -> Arc<Mutex<HashMap<String, String>>> {
        let mut env = HashMap::new();
        env.insert("USER".to_string(), "root".to_string());
        env.insert("TERM".to_string(), "xterm".to_string());
        env.insert("SHELL".to_string(), "/bin/bash".to_string());
        Arc::new(Mutex::new(env))
    }

    async fn scripted_session(input: &[u8]) -> String {
        let (client, server) = duplex(256 * 1024);
        let term = Terminal::new(
            server,
            SessionFs::new(),
            default_env(),
            Arc::new(Mutex::new(WinSize::default())),
        );
        let handle = tokio::spawn(term.run());

        let (mut rd, mut wr) = tokio::io::split(client);
        wr.write_all(input).await.unwrap();
        handle.await.unwrap();
        drop(wr);

        let mut out = Vec::new();
        rd.read_to_end(&mut out).await.unwrap();
        String::from_utf8_lossy(&out).into_owned()
    }

    #[tokio::test]
    async fn test_session_banner_prompt_and_echo() {
        let out = scripted_session(b"echo hello\rexit\r").await;
        assert!(out.contains("Welcome to Ubuntu 22.04 LTS"));
        assert!(out.contains("root@ubuntu-server"));
        // Bare \n from the command is CRLF-converted on the wire.
        assert!(out.contains("hello\r\n"));
    }

    #[tokio::test]
    async fn test_ctrl_d_on_empty_line_terminates() {
        let out = scripted_session(b"\x04").await;
        assert!(out.contains("Welcome to Ubuntu"));
    }

    #[tokio::test]
    async fn test_ctrl_c_discards_line() {
        let out = scripted_session(b"garbage\x03exit\r").await;
        assert!(out.contains("^C"));
        // The discarded text was never executed.
        assert!(!out.contains("未找到命令"));
    }

    #[tokio::test]
    async fn test_backspace_edits_line() {
        // "pwdX" then backspace then enter: runs pwd.
        let out = scripted_session(b"pwdX\x7f\rexit\r").await;
        assert!(out.contains("/root\r\n"));
    }

    #[tokio::test]
    async fn test_history_recall_with_arrow_up() {
        // Run pwd, then arrow-up + enter re-runs it.
        let out = scripted_session(b"pwd\r\x1b[A\rexit\r").await;
        assert_eq!(out.matches("/root\r\n").count(), 2);
    }

    #[tokio::test]
    async fn test_tab_completes_unique_command() {
        // "whoam" + TAB completes to "whoami " — unique across /bin and
        // /usr/bin after dedup — and enter runs it.
        let out = scripted_session(b"whoam\t\rexit\r").await;
        assert!(out.contains("whoami"));
        assert!(out.contains("root\r\n"));
    }

    #[tokio::test]
    async fn test_cwd_contraction_in_prompt() {
        let out = scripted_session(b"cd /var/log\rexit\r").await;
        assert!(out.contains("\x1b[1;34m/var/log\x1b[0m#"));
    }

    #[tokio::test]
    async fn test_key_channel_preserves_order() {
        let (client, server) = duplex(4096);
        let raw_keys = Arc::new(Mutex::new(None));
        let running = Arc::new(AtomicBool::new(true));
        let (tx, mut rx) = mpsc::channel(KEY_CHANNEL_CAP);
        let (rd, _wr) = tokio::io::split(server);
        tokio::spawn(input_loop(rd, tx, raw_keys, running));

        let (_crd, mut cwr) = tokio::io::split(client);
        let fed: String = "the quick brown fox".into();
        cwr.write_all(fed.as_bytes()).await.unwrap();
        drop(cwr);

        let mut got = String::new();
        while let Some(ch) = rx.recv().await {
            got.push(ch);
        }
        assert_eq!(got, fed);
    }

    #[tokio::test]
    async fn test_raw_mode_bypasses_editor() {
        let (client, server) = duplex(4096);
        let raw_keys: Arc<Mutex<Option<mpsc::UnboundedSender<char>>>> =
            Arc::new(Mutex::new(None));
        let running = Arc::new(AtomicBool::new(true));
        let (tx, mut editor_rx) = mpsc::channel(KEY_CHANNEL_CAP);
        let (rd, _wr) = tokio::io::split(server);
        tokio::spawn(input_loop(rd, tx, raw_keys.clone(), running));

        let (fg_tx, mut fg_rx) = mpsc::unbounded_channel();
        *raw_keys.lock().unwrap() = Some(fg_tx);

        let (_crd, mut cwr) = tokio::io::split(client);
        cwr.write_all(b"q").await.unwrap();

        // The foreground app sees the key; the editor channel stays empty.
        assert_eq!(fg_rx.recv().await, Some('q'));
        assert!(editor_rx.try_recv().is_err());
    }
}
