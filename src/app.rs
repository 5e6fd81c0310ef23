use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(clap::Parser, Debug)]
#[command(
    version,
    about = "Multi-protocol honeypot impersonating an Ubuntu host",
    long_about = "A honeypot that speaks SSH, Telnet, and rlogin and presents an interactive fake shell over a per-session copy-on-write filesystem. Nothing an attacker types is ever executed on the real host; sessions are observed through the log stream."
)]
pub struct App {
    /// Address for the SSH listener
    #[arg(long = "ssh", default_value = "0.0.0.0:2200", env = "SSH_BIND")]
    pub ssh_addr: SocketAddr,

    /// Address for the Telnet listener
    #[arg(long = "telnet", default_value = "0.0.0.0:2300", env = "TELNET_BIND")]
    pub telnet_addr: SocketAddr,

    /// Address for the rlogin listener
    #[arg(long = "rlogin", default_value = "0.0.0.0:5130", env = "RLOGIN_BIND")]
    pub rlogin_addr: SocketAddr,

    /// Path of the persisted Ed25519 host key (PKCS#8 PEM)
    #[arg(
        long = "host-key",
        default_value = "ssh_host_ed25519_key",
        env = "HOST_KEY_PATH"
    )]
    pub host_key: PathBuf,
}
