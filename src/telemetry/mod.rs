//! Per-session metrics polling.
//!
//! While a session is ready, a fixed set of diagnostic commands runs over
//! fresh exec channels on every tick. Each command is wrapped on its own;
//! one failing or printing garbage only drops that metric for the tick.
//! A `status:update` is pushed only when at least one metric came back.
//!
//! Network throughput is derived, not measured: the poller keeps the
//! previous counter sample and reports `max(0, delta / elapsed)`. The
//! first tick after connect has no previous sample and reports no rate.
//!
//! The poller stops itself when every command fails in one tick or the
//! client channel is gone, so a dead session cannot keep a timer alive.

pub mod parse;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::bridge::SshConnection;
use crate::protocol;

const CPU_CMD: &str = "top -bn1 | head -5";
const MEM_CMD: &str = "free -b";
const DISK_CMD: &str = "df -kP /";
const OS_CMD: &str = "cat /etc/os-release 2>/dev/null || uname -sr";
const NET_CMD: &str = "cat /proc/net/dev";

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Consecutive ticks in which every command fails before the poller gives
/// up. One bad tick can be transient fork pressure on the remote host; a
/// run of them means the transport is gone.
const MAX_FAILED_TICKS: u32 = 3;

/// Previous network counter reading for one session.
#[derive(Debug, Clone, Copy)]
pub struct NetSample {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub taken_at: Instant,
}

/// Receive/transmit rates in bytes per second, clamped at zero so counter
/// resets (interface bounce, wraparound) never report negative traffic.
pub fn net_rate(prev: &NetSample, cur: &NetSample) -> Option<(f64, f64)> {
    let elapsed = cur.taken_at.saturating_duration_since(prev.taken_at);
    if elapsed.is_zero() {
        return None;
    }
    let secs = elapsed.as_secs_f64();
    let rx = cur.rx_bytes.saturating_sub(prev.rx_bytes) as f64 / secs;
    let tx = cur.tx_bytes.saturating_sub(prev.tx_bytes) as f64 / secs;
    Some((rx, tx))
}

/// Spawn the poll loop for one ready session.
pub fn spawn_poller(
    connection: Arc<dyn SshConnection>,
    interval: Duration,
    events: mpsc::Sender<Value>,
    stop: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut prev_net: Option<NetSample> = None;
        let mut failed_ticks: u32 = 0;

        loop {
            tokio::select! {
                () = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let (cpu, mem, disk, os, net) = tokio::join!(
                run(&connection, CPU_CMD),
                run(&connection, MEM_CMD),
                run(&connection, DISK_CMD),
                run(&connection, OS_CMD),
                run(&connection, NET_CMD),
            );

            if [&cpu, &mem, &disk, &os, &net].iter().all(|r| r.is_none()) {
                failed_ticks += 1;
                if failed_ticks >= MAX_FAILED_TICKS {
                    debug!(failed_ticks, "telemetry commands keep failing, stopping poller");
                    break;
                }
                continue;
            }
            failed_ticks = 0;

            let mut metrics = json!({});

            if let Some(cpu) = cpu.as_deref().and_then(parse::cpu_percent) {
                metrics["cpu"] = json!({ "usagePercent": cpu });
            }
            if let Some(mem) = mem.as_deref().and_then(parse::mem_usage) {
                metrics["mem"] = json!({ "total": mem.mem_total, "used": mem.mem_used });
                metrics["swap"] = json!({ "total": mem.swap_total, "used": mem.swap_used });
            }
            if let Some(disk) = disk.as_deref().and_then(parse::disk_usage) {
                metrics["disk"] = json!({
                    "total": disk.total_bytes,
                    "used": disk.used_bytes,
                    "usedPercent": disk.used_percent,
                });
            }
            if let Some(os) = os.as_deref().and_then(parse::os_name) {
                metrics["os"] = json!(os);
            }
            if let Some(counters) = net.as_deref().and_then(parse::net_counters) {
                let sample = NetSample {
                    rx_bytes: counters.rx_bytes,
                    tx_bytes: counters.tx_bytes,
                    taken_at: Instant::now(),
                };
                let mut net_obj = json!({
                    "interface": counters.interface,
                    "rxBytes": counters.rx_bytes,
                    "txBytes": counters.tx_bytes,
                });
                if let Some((rx_rate, tx_rate)) =
                    prev_net.as_ref().and_then(|p| net_rate(p, &sample))
                {
                    net_obj["rxRate"] = json!(rx_rate);
                    net_obj["txRate"] = json!(tx_rate);
                }
                metrics["net"] = net_obj;
                prev_net = Some(sample);
            }

            let has_metrics = metrics.as_object().is_some_and(|m| !m.is_empty());
            if has_metrics && events.send(protocol::status_update(metrics)).await.is_err() {
                break;
            }
        }
    })
}

/// One command, one fresh channel, failures reduced to `None`.
async fn run(connection: &Arc<dyn SshConnection>, command: &str) -> Option<String> {
    match connection.exec(command).await {
        Ok(output) if output.is_success() => Some(output.stdout),
        Ok(output) => {
            debug!(command, exit_code = output.exit_code, "telemetry command failed");
            None
        }
        Err(e) => {
            debug!(command, "telemetry exec failed: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(rx: u64, tx: u64, at: Instant) -> NetSample {
        NetSample {
            rx_bytes: rx,
            tx_bytes: tx,
            taken_at: at,
        }
    }

    #[test]
    fn rate_is_delta_over_elapsed() {
        let start = Instant::now();
        let prev = sample(1000, 500, start);
        let cur = sample(3000, 500, start + Duration::from_secs(2));
        let (rx, tx) = net_rate(&prev, &cur).unwrap();
        assert!((rx - 1000.0).abs() < f64::EPSILON);
        assert!(tx.abs() < f64::EPSILON);
    }

    #[test]
    fn counter_reset_clamps_to_zero() {
        let start = Instant::now();
        let prev = sample(5000, 5000, start);
        let cur = sample(100, 100, start + Duration::from_secs(1));
        let (rx, tx) = net_rate(&prev, &cur).unwrap();
        assert_eq!(rx, 0.0);
        assert_eq!(tx, 0.0);
    }

    #[test]
    fn zero_elapsed_yields_no_rate() {
        let now = Instant::now();
        assert!(net_rate(&sample(1, 1, now), &sample(2, 2, now)).is_none());
    }

    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    use crate::bridge::{BridgeError, ExecOutput, ShellChannel, SshConnection};
    use crate::sftp::SftpBackend;

    /// Connection whose exec fails for the first tick (five commands) and
    /// afterwards answers only the memory command.
    struct FlakyConnection {
        calls: AtomicUsize,
    }

    struct DeadConnection;

    const FREE_OUTPUT: &str = "              total        used        free\n\
                               Mem:     8217579520  3124848640  1073741824\n\
                               Swap:    2147483648   536870912  1610612736\n";

    #[async_trait]
    impl SshConnection for FlakyConnection {
        async fn open_shell(
            &self,
            _cols: u32,
            _rows: u32,
        ) -> Result<Box<dyn ShellChannel>, BridgeError> {
            Err(BridgeError::Disconnected)
        }
        async fn open_sftp(&self) -> Result<Box<dyn SftpBackend>, BridgeError> {
            Err(BridgeError::Disconnected)
        }
        async fn exec(&self, command: &str) -> Result<ExecOutput, BridgeError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < 5 || command != MEM_CMD {
                return Err(BridgeError::Disconnected);
            }
            Ok(ExecOutput {
                stdout: FREE_OUTPUT.to_string(),
                exit_code: 0,
            })
        }
        async fn close(&self) {}
    }

    #[async_trait]
    impl SshConnection for DeadConnection {
        async fn open_shell(
            &self,
            _cols: u32,
            _rows: u32,
        ) -> Result<Box<dyn ShellChannel>, BridgeError> {
            Err(BridgeError::Disconnected)
        }
        async fn open_sftp(&self) -> Result<Box<dyn SftpBackend>, BridgeError> {
            Err(BridgeError::Disconnected)
        }
        async fn exec(&self, _command: &str) -> Result<ExecOutput, BridgeError> {
            Err(BridgeError::Disconnected)
        }
        async fn close(&self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn one_failed_tick_does_not_stop_the_poller() {
        let (tx, mut rx) = mpsc::channel(8);
        let stop = CancellationToken::new();
        spawn_poller(
            Arc::new(FlakyConnection {
                calls: AtomicUsize::new(0),
            }),
            Duration::from_millis(10),
            tx,
            stop.clone(),
        );

        // First tick fails entirely; the second one reports memory anyway.
        let update = rx.recv().await.expect("poller should survive one bad tick");
        assert_eq!(update["type"], "status:update");
        assert_eq!(update["payload"]["mem"]["total"], 8_217_579_520_u64);
        stop.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn poller_stops_after_consecutive_failed_ticks() {
        let (tx, mut rx) = mpsc::channel(8);
        let stop = CancellationToken::new();
        let handle = spawn_poller(
            Arc::new(DeadConnection),
            Duration::from_millis(10),
            tx,
            stop,
        );

        handle.await.expect("poller task should exit on its own");
        assert!(rx.recv().await.is_none());
    }
}
