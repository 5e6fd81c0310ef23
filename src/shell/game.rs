//! `kernelpanic`: a full-screen foreground app that stages a convincing
//! kernel oops, then waits to be dismissed. Mostly here to exercise the
//! raw-mode handoff — while it runs, every keystroke arrives on the
//! channel the command installed instead of the line editor.

use std::io;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout};

use super::commands::{CmdOut, CommandContext};

const DISMISS_TIMEOUT: Duration = Duration::from_secs(30);

const OOPS_LINES: &[&str] = &[
    "[ 3421.801992] BUG: unable to handle page fault for address: ffffffffc0a81337",
    "[ 3421.802301] #PF: supervisor write access in kernel mode",
    "[ 3421.802562] #PF: error_code(0x0002) - not-present page",
    "[ 3421.802833] PGD 3a1e067 P4D 3a1e067 PUD 3a20067 PMD 0",
    "[ 3421.803115] Oops: 0002 [#1] PREEMPT SMP NOPTI",
    "[ 3421.803385] CPU: 1 PID: 832 Comm: sshd Tainted: P           OE     5.15.0-generic",
    "[ 3421.803667] Hardware name: Dell Inc. PowerEdge R740/08D89F, BIOS 2.11.2 004/21/2021",
    "[ 3421.803951] Call Trace:",
    "[ 3421.804219]  <TASK>",
    "[ 3421.804487]  ? __die_body.cold+0x1a/0x1f",
    "[ 3421.804763]  ? page_fault_oops+0x15b/0x2d0",
    "[ 3421.805041]  ? exc_page_fault+0x78/0x170",
    "[ 3421.805320]  ? asm_exc_page_fault+0x27/0x30",
    "[ 3421.805598]  tcp_v4_do_rcv+0x13e/0x2a0",
    "[ 3421.805877]  tcp_v4_rcv+0xcd9/0xda0",
    "[ 3421.806154]  ip_protocol_deliver_rcu+0x2f/0x1b0",
    "[ 3421.806434]  ip_local_deliver_finish+0x48/0x60",
    "[ 3421.806714]  __netif_receive_skb_one_core+0x84/0xa0",
    "[ 3421.806992]  process_backlog+0x97/0x150",
    "[ 3421.807270]  __napi_poll+0x2b/0x160",
    "[ 3421.807548]  net_rx_action+0x23d/0x2a0",
    "[ 3421.807825]  </TASK>",
];

fn register_dump() -> Vec<String> {
    let mut rng = rand::rng();
    let mut r = || rng.random_range(0u64..=u64::MAX);
    vec![
        format!(
            "[ 3421.808101] RIP: 0010:tcp_v4_do_rcv+0x13e/0x2a0 RSP: 0018:{:016x} EFLAGS: 00010246",
            r()
        ),
        format!(
            "[ 3421.808379] RAX: {:016x} RBX: {:016x} RCX: {:016x}",
            r(), r(), r()
        ),
        format!(
            "[ 3421.808655] RDX: {:016x} RSI: {:016x} RDI: {:016x}",
            r(), r(), r()
        ),
        format!(
            "[ 3421.808930] RBP: {:016x} R08: {:016x} R09: {:016x}",
            r(), r(), r()
        ),
        format!(
            "[ 3421.809204] R10: {:016x} R11: {:016x} R12: {:016x}",
            r(), r(), r()
        ),
    ]
}

fn is_dismiss(key: char) -> bool {
    matches!(key, 'q' | 'Q' | '\x03' | '\r' | '\n')
}

/// Run the panic show against `out`, reading dismiss keys from `keys`.
/// Returns once the viewer quits, the channel is torn down, or the
/// dismiss timeout passes.
pub async fn run_kernel_panic(
    out: &mut CmdOut<'_>,
    mut keys: UnboundedReceiver<char>,
    ctx: &CommandContext,
) -> io::Result<()> {
    out.write_all(b"\x1b[2J\x1b[H\x1b[?25l").await?;

    let mut lines: Vec<String> = OOPS_LINES.iter().map(|s| s.to_string()).collect();
    lines.extend(register_dump());
    lines.push("[ 3421.809483] ---[ end trace 5f1c1b8e9d0a42aa ]---".to_string());
    lines.push(String::new());
    lines.push("Kernel panic - not syncing: Fatal exception in interrupt".to_string());

    // Jitter per line, drawn up front so no RNG lives across an await.
    let delays: Vec<u64> = lines
        .iter()
        .map(|_| rand::rng().random_range(30..90))
        .collect();
    for (line, delay) in lines.iter().zip(delays) {
        out.print(line).await?;
        out.write_all(b"\r\n").await?;
        // The scroll stays interruptible; any dismiss key cuts it short.
        if let Ok(Some(k)) = timeout(Duration::from_millis(delay), keys.recv()).await {
            if is_dismiss(k) {
                return restore(out).await;
            }
        }
    }

    let cols = ctx.win_size().cols.max(20) as usize;
    let banner = "*** SYSTEM HALTED ***";
    let pad = cols.saturating_sub(banner.len()) / 2;
    out.write_all(b"\r\n").await?;
    out.print(&format!("{}\x1b[1;37;41m{banner}\x1b[0m\r\n", " ".repeat(pad)))
        .await?;
    sleep(Duration::from_millis(300)).await;

    match timeout(DISMISS_TIMEOUT, async {
        while let Some(k) = keys.recv().await {
            if is_dismiss(k) {
                break;
            }
        }
    })
    .await
    {
        Ok(()) | Err(_) => restore(out).await,
    }
}

async fn restore(out: &mut CmdOut<'_>) -> io::Result<()> {
    out.write_all(b"\x1b[?25h\x1b[2J\x1b[H").await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::pipeline::test_support::plain_ctx;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_panic_show_dismisses_on_q() {
        let ctx = plain_ctx();
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send('q').unwrap();
        let mut sink = std::io::Cursor::new(Vec::new());
        {
            let mut out = CmdOut::terminal(&mut sink);
            run_kernel_panic(&mut out, rx, &ctx).await.unwrap();
        }
        let shown = String::from_utf8_lossy(sink.get_ref()).into_owned();
        // Cleared, cursor hidden, and restored at the end.
        assert!(shown.starts_with("\x1b[2J\x1b[H\x1b[?25l"));
        assert!(shown.ends_with("\x1b[?25h\x1b[2J\x1b[H"));
    }

    #[tokio::test]
    async fn test_panic_show_ends_when_channel_closes() {
        let ctx = plain_ctx();
        let (tx, rx) = mpsc::unbounded_channel::<char>();
        drop(tx);
        let mut sink = std::io::Cursor::new(Vec::new());
        {
            let mut out = CmdOut::terminal(&mut sink);
            run_kernel_panic(&mut out, rx, &ctx).await.unwrap();
        }
        let shown = String::from_utf8_lossy(sink.get_ref()).into_owned();
        assert!(shown.contains("Kernel panic - not syncing"));
        assert!(shown.contains("SYSTEM HALTED"));
    }
}
