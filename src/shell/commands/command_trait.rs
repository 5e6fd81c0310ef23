use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use super::context::CommandContext;

/// Exit codes reported through `$?`.
pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_USAGE: i32 = 2;
pub const EXIT_NOT_FOUND: i32 = 127;

/// Command input stream. Always read incrementally — a command that
/// buffers its whole input can deadlock the pipeline it sits in.
pub struct CmdIn {
    inner: BufReader<Box<dyn AsyncRead + Send + Unpin>>,
}

impl CmdIn {
    pub fn new(r: Box<dyn AsyncRead + Send + Unpin>) -> Self {
        Self {
            inner: BufReader::new(r),
        }
    }

    /// Empty input for the first (or only) stage of a pipeline.
    pub fn empty() -> Self {
        Self::new(Box::new(tokio::io::empty()))
    }

    /// Next line without its trailing newline, `None` at EOF. Invalid
    /// UTF-8 is replaced rather than rejected; attackers paste anything.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        let mut buf = Vec::new();
        let n = self.inner.read_until(b'\n', &mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        }
        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }

    pub fn reader(&mut self) -> &mut (impl AsyncRead + Unpin) {
        &mut self.inner
    }
}

/// Command output sink. `tty` is true only for the terminal-facing
/// CRLF-converting writer, never for a pipe or a redirection buffer;
/// commands key their color output off it.
pub struct CmdOut<'a> {
    w: &'a mut (dyn AsyncWrite + Send + Unpin),
    tty: bool,
}

impl<'a> CmdOut<'a> {
    pub fn terminal(w: &'a mut (dyn AsyncWrite + Send + Unpin)) -> Self {
        Self { w, tty: true }
    }

    pub fn pipe(w: &'a mut (dyn AsyncWrite + Send + Unpin)) -> Self {
        Self { w, tty: false }
    }

    pub fn is_tty(&self) -> bool {
        self.tty
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.w.write_all(bytes).await
    }

    pub async fn print(&mut self, s: &str) -> io::Result<()> {
        self.w.write_all(s.as_bytes()).await
    }

    pub async fn println(&mut self, s: &str) -> io::Result<()> {
        self.w.write_all(s.as_bytes()).await?;
        self.w.write_all(b"\n").await
    }

    pub fn writer(&mut self) -> &mut (dyn AsyncWrite + Send + Unpin) {
        self.w
    }
}

/// A simulated command. Implementations are stream-oriented: they read
/// from `input` and write to `out`, and must stay line-incremental on
/// unbounded input so pipelines keep flowing.
///
/// An `Err` return means the output side went away (downstream stage
/// finished); the dispatcher folds it into a failure exit code.
#[async_trait]
pub trait Command: Send + Sync {
    fn name(&self) -> &'static str;

    fn aliases(&self) -> Vec<&'static str> {
        Vec::new()
    }

    async fn run(
        &self,
        args: &[String],
        input: &mut CmdIn,
        out: &mut CmdOut<'_>,
        ctx: &CommandContext,
    ) -> io::Result<i32>;
}
