mod app;
mod keys;
mod rlogin;
mod server;
mod sftp;
mod shell;
mod telnet;

use clap::Parser;

use crate::app::App;

#[tokio::main]
async fn main() {
    env_logger::builder()
        .parse_env(env_logger::Env::default())
        .filter_level(log::LevelFilter::Info)
        .filter_module("russh", log::LevelFilter::Warn)
        .init();

    let app = App::parse();

    // Build the shared base image before the first connection lands.
    let _ = shell::filesystem::base::base();

    log::trace!("loading or generating host key");
    let host_key = keys::load_or_generate(&app.host_key);

    let mut tasks = Vec::with_capacity(3);
    tasks.push(tokio::spawn(server::run_listener(app.ssh_addr, host_key)));
    tasks.push(tokio::spawn(telnet::run_listener(app.telnet_addr)));
    tasks.push(tokio::spawn(rlogin::run_listener(app.rlogin_addr)));

    log::info!(
        "fake server suite running — ssh {}, telnet {}, rlogin {}",
        app.ssh_addr,
        app.telnet_addr,
        app.rlogin_addr
    );

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM");
        tokio::select! {
            _ = sigterm.recv() => {},
            _ = tokio::signal::ctrl_c() => {},
        }
    }
    #[cfg(windows)]
    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl+c");

    log::info!("shutting down");
    for task in tasks {
        task.abort();
    }
}
