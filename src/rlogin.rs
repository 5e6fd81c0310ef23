//! rlogin front-end (RFC 1282): four NUL-terminated startup fields, a
//! single zero-byte acknowledgement, and in-band `0xFF 0xFF 's' 's'`
//! window-change frames carrying rows/cols/xpixels/ypixels as big-endian
//! 16-bit values. Everything else passes straight through to the
//! terminal; malformed control traffic is dropped, never fatal.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{
    simplex, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
    ReadBuf, ReadHalf, SimplexStream, WriteHalf,
};
use tokio::net::TcpListener;

use crate::shell::filesystem::session::SessionFs;
use crate::shell::terminal::Terminal;
use crate::shell::WinSize;

const APP_PIPE_CAPACITY: usize = 8 * 1024;
const MAX_STARTUP_FIELD: usize = 512;
const MAX_LINE_LEN: usize = 256;

pub async fn run_listener(addr: SocketAddr) {
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(err) => {
            log::error!("[rlogin] failed to listen on {addr}: {err}");
            return;
        }
    };
    log::info!("[rlogin] listening on {addr}");
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                log::debug!("[rlogin] connection from {peer}");
                tokio::spawn(handle_stream(socket));
            }
            Err(err) => {
                log::warn!("[rlogin] accept failed: {err}");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

/// Pulls window-change control frames out of the inbound stream; all
/// other bytes are forwarded verbatim to the application pipe.
struct ControlFilter<R> {
    reader: BufReader<R>,
    app_tx: WriteHalf<SimplexStream>,
    size: Arc<Mutex<WinSize>>,
    state: u8,
    win_buf: Vec<u8>,
}

impl<R: AsyncRead + Send + Unpin> ControlFilter<R> {
    fn new(reader: BufReader<R>, app_tx: WriteHalf<SimplexStream>, size: Arc<Mutex<WinSize>>) -> Self {
        Self {
            reader,
            app_tx,
            size,
            state: 0,
            win_buf: Vec::with_capacity(8),
        }
    }

    async fn run(mut self) {
        if let Err(err) = self.pump().await {
            log::trace!("[rlogin] filter pump ended: {err}");
        }
    }

    async fn pump(&mut self) -> io::Result<()> {
        loop {
            let b = match self.reader.read_u8().await {
                Ok(b) => b,
                Err(_) => return Ok(()),
            };
            match self.state {
                0 => {
                    if b == 0xFF {
                        self.state = 1;
                    } else {
                        self.app_tx.write_all(&[b]).await?;
                    }
                }
                1 => self.state = if b == 0xFF { 2 } else { 0 },
                2 => self.state = if b == b's' { 3 } else { 0 },
                3 => {
                    if b == b's' {
                        self.state = 4;
                        self.win_buf.clear();
                    } else {
                        self.state = 0;
                    }
                }
                _ => {
                    self.win_buf.push(b);
                    if self.win_buf.len() == 8 {
                        let rows = u16::from_be_bytes([self.win_buf[0], self.win_buf[1]]);
                        let cols = u16::from_be_bytes([self.win_buf[2], self.win_buf[3]]);
                        {
                            let mut size =
                                self.size.lock().unwrap_or_else(PoisonError::into_inner);
                            size.cols = cols;
                            size.rows = rows;
                        }
                        self.state = 0;
                    }
                }
            }
        }
    }
}

/// Stream handed to the terminal: filtered reads, passthrough writes.
struct RloginIo<W> {
    rx: ReadHalf<SimplexStream>,
    tx: W,
}

impl<W: AsyncWrite + Unpin> AsyncRead for RloginIo<W> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().rx).poll_read(cx, buf)
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for RloginIo<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().tx).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().tx).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().tx).poll_shutdown(cx)
    }
}

/// One NUL-terminated startup field, bounded against hostile peers.
async fn read_field<R: AsyncRead + Unpin>(reader: &mut BufReader<R>) -> Option<String> {
    let mut buf = Vec::new();
    let n = reader.read_until(0, &mut buf).await.ok()?;
    if n == 0 {
        return None;
    }
    if buf.last() == Some(&0) {
        buf.pop();
    }
    if buf.len() > MAX_STARTUP_FIELD {
        buf.truncate(MAX_STARTUP_FIELD);
    }
    Some(String::from_utf8_lossy(&buf).into_owned())
}

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
    let (rd, mut wr) = tokio::io::split(stream);
    let mut reader = BufReader::new(rd);

    // Startup: empty field, client user, server user, "term/speed".
    let Some(_) = read_field(&mut reader).await else { return };
    let Some(client_user) = read_field(&mut reader).await else { return };
    let Some(server_user) = read_field(&mut reader).await else { return };
    let Some(term_info) = read_field(&mut reader).await else { return };

    if wr.write_all(&[0]).await.is_err() {
        return;
    }

    let term_type = term_info
        .split('/')
        .next()
        .filter(|t| !t.is_empty())
        .unwrap_or("vt100")
        .to_string();
    let user = if server_user == "root" {
        "root".to_string()
    } else {
        client_user.clone()
    };

    let size = Arc::new(Mutex::new(WinSize::default()));
    let (app_rx, app_tx) = simplex(APP_PIPE_CAPACITY);
    tokio::spawn(ControlFilter::new(reader, app_tx, size.clone()).run());

    let mut io = RloginIo { rx: app_rx, tx: wr };

    let _ = io.write_all(b"Password: ").await;
    let password = read_line(&mut io).await;
    let _ = io.write_all(b"\r\n").await;
    log::info!(
        "[rlogin] login client_user={client_user:?} server_user={server_user:?} password={password:?} — accepted"
    );

    let home = if user == "root" {
        "/root".to_string()
    } else {
        format!("/home/{user}")
    };
    let env = Arc::new(Mutex::new(HashMap::from([
        ("TERM".to_string(), term_type),
        ("USER".to_string(), user.clone()),
        ("HOME".to_string(), home),
        ("SHELL".to_string(), "/bin/bash".to_string()),
    ])));

    let term = Terminal::new(io, SessionFs::new(), env, size);
    term.run().await;
    log::debug!("[rlogin] session for {user:?} closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_window_change_frame_updates_size() {
        let (mut client, server) = duplex(4096);
        let (rd, _wr) = tokio::io::split(server);
        let size = Arc::new(Mutex::new(WinSize::default()));
        let (mut app_rx, app_tx) = simplex(4096);
        tokio::spawn(ControlFilter::new(BufReader::new(rd), app_tx, size.clone()).run());

        // rows=24 cols=120 xpix=640 ypix=480, then a data byte.
        client
            .write_all(&[0xFF, 0xFF, b's', b's', 0, 24, 0, 120, 2, 128, 1, 224, b'z'])
            .await
            .unwrap();
        let mut one = [0u8; 1];
        app_rx.read_exact(&mut one).await.unwrap();
        assert_eq!(&one, b"z");
        assert_eq!(*size.lock().unwrap(), WinSize { cols: 120, rows: 24 });
    }

    #[tokio::test]
    async fn test_partial_control_prefix_is_swallowed() {
        let (mut client, server) = duplex(4096);
        let (rd, _wr) = tokio::io::split(server);
        let size = Arc::new(Mutex::new(WinSize::default()));
        let (mut app_rx, app_tx) = simplex(4096);
        tokio::spawn(ControlFilter::new(BufReader::new(rd), app_tx, size.clone()).run());

        // A lone 0xFF starts control detection and consumes the byte that
        // breaks the match; plain data after it flows on.
        client.write_all(&[0xFF, b'x', b'o', b'k']).await.unwrap();
        let mut two = [0u8; 2];
        app_rx.read_exact(&mut two).await.unwrap();
        assert_eq!(&two, b"ok");
    }

    #[tokio::test]
    async fn test_startup_frame_and_login() {
        let (client, server) = duplex(256 * 1024);
        let handle = tokio::spawn(handle_stream(server));
        let (mut crd, mut cwr) = tokio::io::split(client);

        cwr.write_all(b"\0attacker\0root\0xterm/38400\0").await.unwrap();
        cwr.write_all(b"hunter2\r\n").await.unwrap();
        cwr.write_all(b"whoami\r\nexit\r\n").await.unwrap();
        handle.await.unwrap();
        drop(cwr);

        let mut out = Vec::new();
        crd.read_to_end(&mut out).await.unwrap();
        // Ack byte first, then the password prompt, then the shell.
        assert_eq!(out[0], 0);
        let text = String::from_utf8_lossy(&out[1..]);
        assert!(text.contains("Password: "));
        // server_user root forces the session user to root.
        assert!(text.contains("root\r\n"));
        assert!(text.contains("root@ubuntu-server"));
    }

    #[tokio::test]
    async fn test_fuzz_garbage_startup_terminates() {
        for pattern in [
            vec![0xFFu8],
            vec![0xFF, 0xFF, b's'],
            vec![0x00, 0x01, 0x02, 0x03],
            Vec::new(),
        ] {
            let (client, server) = duplex(16 * 1024);
            let handle = tokio::spawn(handle_stream(server));
            let (mut crd, mut cwr) = tokio::io::split(client);
            let drain = tokio::spawn(async move {
                let mut sink = Vec::new();
                let _ = crd.read_to_end(&mut sink).await;
            });
            cwr.write_all(&pattern).await.unwrap();
            drop(cwr);
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .expect("rlogin handler hung on garbage")
                .unwrap();
            let _ = drain.await;
        }
    }
}
