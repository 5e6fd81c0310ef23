//! Telnet front-end: RFC-854 option negotiation with NAWS (RFC 1073),
//! TTYPE (RFC 1091/1408-style IS framing), and NEW-ENVIRON (RFC 1572).
//!
//! A pump task strips protocol traffic out of the inbound byte stream and
//! feeds pure application bytes to the terminal through an in-memory pipe;
//! negotiation replies and terminal output both leave through an outbound
//! writer task. Garbage on the wire is never fatal — unknown options are
//! refused and malformed frames are dropped.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{
    simplex, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf, ReadHalf,
    SimplexStream, WriteHalf,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::shell::filesystem::session::SessionFs;
use crate::shell::terminal::Terminal;
use crate::shell::WinSize;

// Telnet commands.
const CMD_SE: u8 = 240;
const CMD_SB: u8 = 250;
const CMD_WILL: u8 = 251;
const CMD_WONT: u8 = 252;
const CMD_DO: u8 = 253;
const CMD_DONT: u8 = 254;
const CMD_IAC: u8 = 255;

// Options we negotiate.
const OPT_ECHO: u8 = 1;
const OPT_SGA: u8 = 3;
const OPT_TTYPE: u8 = 24;
const OPT_NAWS: u8 = 31;
const OPT_NEW_ENV: u8 = 39;

// Subnegotiation verbs.
const SUB_IS: u8 = 0;
const SUB_SEND: u8 = 1;

// NEW-ENVIRON field kinds.
const ENV_VAR: u8 = 0;
const ENV_VALUE: u8 = 1;
const ENV_USERVAR: u8 = 3;

const APP_PIPE_CAPACITY: usize = 8 * 1024;
const MAX_SUBNEG_LEN: usize = 4096;
const MAX_LINE_LEN: usize = 256;

pub async fn run_listener(addr: SocketAddr) {
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(err) => {
            log::error!("[telnet] failed to listen on {addr}: {err}");
            return;
        }
    };
    log::info!("[telnet] listening on {addr}");
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                log::debug!("[telnet] connection from {peer}");
                tokio::spawn(handle_stream(socket));
            }
            Err(err) => {
                log::warn!("[telnet] accept failed: {err}");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

/// Protocol decoder. Owns the socket's read side; application bytes go
/// out through `app_tx`, protocol replies through `out_tx`.
struct Negotiator<R> {
    reader: BufReader<R>,
    out_tx: mpsc::UnboundedSender<Vec<u8>>,
    app_tx: WriteHalf<SimplexStream>,
    env: Arc<Mutex<HashMap<String, String>>>,
    size: Arc<Mutex<WinSize>>,
    negotiated: HashSet<u8>,
    skip_lf: bool,
}

impl<R: AsyncRead + Send + Unpin> Negotiator<R> {
    async fn run(mut self) {
        if let Err(err) = self.pump().await {
            log::trace!("[telnet] decode pump ended: {err}");
        }
        // app_tx drops here, which is EOF for the terminal.
    }

    async fn pump(&mut self) -> io::Result<()> {
        loop {
            let b = match self.reader.read_u8().await {
                Ok(b) => b,
                Err(_) => return Ok(()),
            };

            if self.skip_lf {
                self.skip_lf = false;
                if b == b'\n' || b == 0 {
                    continue;
                }
            }

            if b != CMD_IAC {
                if b == b'\r' {
                    self.skip_lf = true;
                    self.emit(b'\n').await?;
                } else {
                    self.emit(b).await?;
                }
                continue;
            }

            let cmd = self.reader.read_u8().await?;
            if cmd == CMD_IAC {
                // Stuffed 0xFF is a literal data byte.
                self.emit(CMD_IAC).await?;
                continue;
            }
            match cmd {
                CMD_WILL | CMD_WONT | CMD_DO | CMD_DONT => {
                    let opt = self.reader.read_u8().await?;
                    self.handle_option(cmd, opt);
                }
                CMD_SB => {
                    let payload = self.read_subnegotiation().await?;
                    self.handle_subnegotiation(&payload);
                }
                // NOP, GA, anything else in-band: ignore.
                _ => {}
            }
        }
    }

    async fn emit(&mut self, b: u8) -> io::Result<()> {
        self.app_tx.write_all(&[b]).await
    }

    fn send(&self, bytes: Vec<u8>) {
        let _ = self.out_tx.send(bytes);
    }

    fn handle_option(&mut self, cmd: u8, opt: u8) {
        if self.negotiated.contains(&opt) {
            return;
        }
        match cmd {
            CMD_WILL => match opt {
                OPT_TTYPE | OPT_NAWS | OPT_NEW_ENV => {
                    self.send(vec![CMD_IAC, CMD_DO, opt]);
                    self.negotiated.insert(opt);
                    if opt == OPT_TTYPE {
                        self.send(vec![CMD_IAC, CMD_SB, OPT_TTYPE, SUB_SEND, CMD_IAC, CMD_SE]);
                    }
                    if opt == OPT_NEW_ENV {
                        let mut req = vec![CMD_IAC, CMD_SB, OPT_NEW_ENV, SUB_SEND];
                        req.push(ENV_VAR);
                        req.extend_from_slice(b"USER");
                        req.push(ENV_VAR);
                        req.extend_from_slice(b"TERM");
                        req.extend_from_slice(&[CMD_IAC, CMD_SE]);
                        self.send(req);
                    }
                }
                _ => self.send(vec![CMD_IAC, CMD_DONT, opt]),
            },
            CMD_DO => match opt {
                OPT_SGA | OPT_ECHO => {
                    self.send(vec![CMD_IAC, CMD_WILL, opt]);
                    self.negotiated.insert(opt);
                }
                _ => self.send(vec![CMD_IAC, CMD_WONT, opt]),
            },
            // WONT/DONT need no reply from us.
            _ => {}
        }
    }

    async fn read_subnegotiation(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        loop {
            let b = self.reader.read_u8().await?;
            if b == CMD_IAC {
                let next = self.reader.read_u8().await?;
                if next == CMD_SE {
                    return Ok(buf);
                }
                buf.push(b);
                buf.push(next);
            } else {
                buf.push(b);
            }
            if buf.len() > MAX_SUBNEG_LEN {
                // Hostile frame; hand back what we have and resync.
                return Ok(buf);
            }
        }
    }

    fn handle_subnegotiation(&mut self, data: &[u8]) {
        let Some((&opt, payload)) = data.split_first() else {
            return;
        };
        match opt {
            OPT_NAWS => {
                if payload.len() >= 4 {
                    let cols = u16::from_be_bytes([payload[0], payload[1]]);
                    let rows = u16::from_be_bytes([payload[2], payload[3]]);
                    let mut size = self.size.lock().unwrap_or_else(PoisonError::into_inner);
                    size.cols = cols;
                    size.rows = rows;
                }
            }
            OPT_TTYPE => {
                if payload.len() >= 2 && payload[0] == SUB_IS {
                    let term = String::from_utf8_lossy(&payload[1..]).into_owned();
                    self.env
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert("TERM".to_string(), term);
                }
            }
            OPT_NEW_ENV => {
                if !payload.is_empty() && payload[0] == SUB_IS {
                    self.parse_environ(&payload[1..]);
                }
            }
            _ => {}
        }
    }

    fn parse_environ(&mut self, mut vars: &[u8]) {
        while !vars.is_empty() {
            if vars[0] != ENV_VAR && vars[0] != ENV_USERVAR {
                break;
            }
            vars = &vars[1..];
            let Some(end_key) = vars.iter().position(|&b| b == ENV_VALUE) else {
                break;
            };
            let key = String::from_utf8_lossy(&vars[..end_key]).into_owned();
            vars = &vars[end_key + 1..];
            let value = match vars
                .iter()
                .position(|&b| b == ENV_VAR || b == ENV_USERVAR)
            {
                Some(end_val) => {
                    let v = String::from_utf8_lossy(&vars[..end_val]).into_owned();
                    vars = &vars[end_val..];
                    v
                }
                None => {
                    let v = String::from_utf8_lossy(vars).into_owned();
                    vars = &[];
                    v
                }
            };
            if !key.is_empty() {
                self.env
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(key, value);
            }
        }
    }
}

/// The decoded stream handed to the terminal: reads come from the pump's
/// application pipe, writes get IAC-stuffed and queued for the socket.
struct TelnetIo {
    rx: ReadHalf<SimplexStream>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl AsyncRead for TelnetIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().rx).poll_read(cx, buf)
    }
}

impl AsyncWrite for TelnetIo {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut stuffed = Vec::with_capacity(buf.len());
        for &b in buf {
            if b == CMD_IAC {
                stuffed.push(CMD_IAC);
            }
            stuffed.push(b);
        }
        match self.tx.send(stuffed) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

async fn write_pump<W: AsyncWrite + Unpin>(mut rx: mpsc::UnboundedReceiver<Vec<u8>>, mut wr: W) {
    while let Some(chunk) = rx.recv().await {
        if wr.write_all(&chunk).await.is_err() {
            break;
        }
    }
    let _ = wr.shutdown().await;
}

/// One byte at a time off the decoded stream until newline; lossy and
/// bounded, because login prompts see as much garbage as anything else.
async fn read_line<R: AsyncRead + Unpin>(r: &mut R) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match r.read_exact(&mut byte).await {
            Err(_) => break,
            Ok(_) => {
                if byte[0] == b'\n' || byte[0] == b'\r' {
                    break;
                }
                buf.push(byte[0]);
                if buf.len() > MAX_LINE_LEN {
                    break;
                }
            }
        }
    }
    String::from_utf8_lossy(&buf).trim().to_string()
}

pub(crate) async fn handle_stream<S>(stream: S)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (rd, wr) = tokio::io::split(stream);
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    tokio::spawn(write_pump(out_rx, wr));

    let env: Arc<Mutex<HashMap<String, String>>> = Arc::new(Mutex::new(HashMap::from([
        ("TERM".to_string(), "vt100".to_string()),
        ("SHELL".to_string(), "/bin/bash".to_string()),
    ])));
    let size = Arc::new(Mutex::new(WinSize::default()));

    let (app_rx, app_tx) = simplex(APP_PIPE_CAPACITY);
    let negotiator = Negotiator {
        reader: BufReader::new(rd),
        out_tx: out_tx.clone(),
        app_tx,
        env: env.clone(),
        size: size.clone(),
        negotiated: HashSet::new(),
        skip_lf: false,
    };
    tokio::spawn(negotiator.run());

    let mut io = TelnetIo {
        rx: app_rx,
        tx: out_tx,
    };

    if io
        .write_all(b"\r\nUbuntu 22.04 LTS\r\nubuntu-server login: ")
        .await
        .is_err()
    {
        return;
    }
    let user = read_line(&mut io).await;
    if user.is_empty() {
        return;
    }
    {
        let mut env = env.lock().unwrap_or_else(PoisonError::into_inner);
        let home = if user == "root" {
            "/root".to_string()
        } else {
            format!("/home/{user}")
        };
        env.insert("USER".to_string(), user.clone());
        env.insert("HOME".to_string(), home);
    }

    let _ = io.write_all(b"Password: ").await;
    let password = read_line(&mut io).await;
    let _ = io.write_all(b"\r\n").await;
    log::info!("[telnet] login user={user:?} password={password:?} — accepted");

    let term = Terminal::new(io, SessionFs::new(), env, size);
    term.run().await;
    log::debug!("[telnet] session for {user:?} closed");
}
