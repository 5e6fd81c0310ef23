//! SSH front-end. Every password is accepted; each connection gets its
//! own copy-on-write session filesystem shared by all of its channels
//! (shell, exec, and SFTP alike), so an upload over SFTP is visible to a
//! `cat` in the same session and to nobody else.

use std::collections::HashMap;
use std::future::Future;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use russh::keys::PrivateKey;
use russh::server::{Auth, Handler, Msg, Server, Session};
use russh::{Channel, ChannelId, Error, MethodKind, Pty, SshId};

use crate::sftp::SftpSession;
use crate::shell::filesystem::session::SessionFs;
use crate::shell::terminal::Terminal;
use crate::shell::WinSize;

const SERVER_ID: &str = "SSH-2.0-OpenSSH_8.9p1 Ubuntu-3ubuntu0.1";

pub async fn run_listener(addr: SocketAddr, host_key: PrivateKey) {
    let config = russh::server::Config {
        server_id: SshId::Standard(SERVER_ID.to_string()),
        keys: vec![host_key],
        methods: (&[MethodKind::Password]).as_slice().into(),
        inactivity_timeout: Some(Duration::from_secs(600)),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        ..Default::default()
    };

    let mut server = SshListener;
    log::info!("[ssh] listening on {addr}");
    if let Err(err) = server.run_on_address(Arc::new(config), addr).await {
        log::error!("[ssh] listener failed on {addr}: {err}");
    }
}

struct SshListener;

impl Server for SshListener {
    type Handler = SshHandler;

    fn new_client(&mut self, peer: Option<SocketAddr>) -> SshHandler {
        log::info!("[ssh] connection from {peer:?}");
        SshHandler {
            peer,
            fs: SessionFs::new(),
            channels: HashMap::new(),
        }
    }

    fn handle_session_error(&mut self, error: <Self::Handler as Handler>::Error) {
        match error {
            Error::Disconnect => {}
            Error::IO(err) => match err.kind() {
                ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset => {
                    log::debug!("[ssh] peer dropped the connection: {err}");
                }
                _ => log::warn!("[ssh] session I/O error: {err}"),
            },
            err => log::debug!("[ssh] session error: {err:?}"),
        }
    }
}

/// Per-channel state accumulated from pty/env requests before shell or
/// exec arrives. `env` and `size` stay shared with the running terminal
/// afterwards so window-change keeps working.
struct ChannelState {
    channel: Option<Channel<Msg>>,
    env: Arc<Mutex<HashMap<String, String>>>,
    size: Arc<Mutex<WinSize>>,
}

impl ChannelState {
    fn new(channel: Channel<Msg>) -> Self {
        let env = HashMap::from([
            ("TERM".to_string(), "xterm-256color".to_string()),
            (
                "PATH".to_string(),
                "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
            ),
            ("USER".to_string(), "root".to_string()),
            ("HOME".to_string(), "/root".to_string()),
            ("SHELL".to_string(), "/bin/bash".to_string()),
            ("LANG".to_string(), "en_US.UTF-8".to_string()),
        ]);
        Self {
            channel: Some(channel),
            env: Arc::new(Mutex::new(env)),
            size: Arc::new(Mutex::new(WinSize::default())),
        }
    }
}

pub struct SshHandler {
    peer: Option<SocketAddr>,
    fs: Arc<SessionFs>,
    channels: HashMap<ChannelId, ChannelState>,
}

impl Handler for SshHandler {
    type Error = russh::Error;

    fn auth_password(
        &mut self,
        user: &str,
        password: &str,
    ) -> impl Future<Output = Result<Auth, Self::Error>> + Send {
        log::info!(
            "[ssh] password auth from {:?} user={user:?} password={password:?} — accepted",
            self.peer
        );
        async { Ok(Auth::Accept) }
    }

    fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        log::debug!("[ssh] session channel {} opened", channel.id());
        self.channels.insert(channel.id(), ChannelState::new(channel));
        async { Ok(true) }
    }

    fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        self.channels.remove(&channel);
        async { Ok(()) }
    }

    fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async move {
            if let Some(state) = self.channels.get(&channel) {
                state
                    .env
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert("TERM".to_string(), term.to_string());
                let mut size = state.size.lock().unwrap_or_else(PoisonError::into_inner);
                size.cols = col_width as u16;
                size.rows = row_height as u16;
            }
            session.channel_success(channel)?;
            Ok(())
        }
    }

    fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        if let Some(state) = self.channels.get(&channel) {
            let mut size = state.size.lock().unwrap_or_else(PoisonError::into_inner);
            size.cols = col_width as u16;
            size.rows = row_height as u16;
        }
        async { Ok(()) }
    }

    fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        if let Some(state) = self.channels.get(&channel) {
            state
                .env
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(variable_name.to_string(), variable_value.to_string());
        }
        async { Ok(()) }
    }

    fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async move {
            let Some((ch, env, size)) = self.take_channel(channel) else {
                session.channel_failure(channel)?;
                return Ok(());
            };
            session.channel_success(channel)?;

            log::debug!("[ssh] starting shell on channel {channel}");
            let handle = session.handle();
            let term = Terminal::new(ch.into_stream(), self.fs.clone(), env, size);
            tokio::spawn(async move {
                term.run().await;
                let _ = handle.close(channel).await;
            });
            Ok(())
        }
    }

    fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        let cmdline = String::from_utf8_lossy(data).into_owned();
        async move {
            let Some((ch, env, size)) = self.take_channel(channel) else {
                session.channel_failure(channel)?;
                return Ok(());
            };
            session.channel_success(channel)?;

            log::info!("[ssh] exec on channel {channel}: {cmdline:?}");
            let handle = session.handle();
            let term = Terminal::new(ch.into_stream(), self.fs.clone(), env, size);
            tokio::spawn(async move {
                term.exec(&cmdline).await;
                let _ = handle.exit_status_request(channel, 0).await;
                let _ = handle.eof(channel).await;
                let _ = handle.close(channel).await;
            });
            Ok(())
        }
    }

    fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        let name = name.to_string();
        async move {
            if name != "sftp" {
                log::debug!("[ssh] unsupported subsystem {name:?} on channel {channel}");
                session.channel_failure(channel)?;
                return Ok(());
            }
            let Some((ch, _env, _size)) = self.take_channel(channel) else {
                session.channel_failure(channel)?;
                return Ok(());
            };
            session.channel_success(channel)?;

            log::info!("[ssh] starting sftp subsystem on channel {channel}");
            let sftp = SftpSession::new(self.fs.clone());
            tokio::spawn(async move {
                russh_sftp::server::run(ch.into_stream(), sftp).await;
            });
            Ok(())
        }
    }
}

impl SshHandler {
    #[allow(clippy::type_complexity)]
    fn take_channel(
        &mut self,
        id: ChannelId,
    ) -> Option<(
        Channel<Msg>,
        Arc<Mutex<HashMap<String, String>>>,
        Arc<Mutex<WinSize>>,
    )> {
        let state = self.channels.get_mut(&id)?;
        let ch = state.channel.take()?;
        Some((ch, state.env.clone(), state.size.clone()))
    }
}
