//! LED gateway: maps "marker inside circle?" onto a single serial byte.
//!
//! The device protocol is one byte per state change: `'1'` on, `'0'` off.
//! Write failures never disturb the pipeline; they are logged at most once
//! per minute and the gateway keeps running as a sink.

use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

pub const LED_BAUD: u32 = 9600;

const FAILURE_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Run the gateway until the sender side closes. Updates are coalesced:
/// only the most recently requested state is written, and only on change.
pub async fn led_loop(path: Option<String>, mut rx: mpsc::Receiver<bool>) {
    let Some(path) = path else {
        // No device configured: behave as a no-op sink.
        while rx.recv().await.is_some() {}
        return;
    };

    let mut port = match tokio_serial::new(&path, LED_BAUD).open_native_async() {
        Ok(port) => {
            info!("LED gateway connected on {path}");
            Some(port)
        }
        Err(e) => {
            warn!("could not open LED device {path}: {e}; LED feedback disabled");
            None
        }
    };
    #[cfg(unix)]
    if let Some(p) = port.as_mut() {
        if let Err(e) = p.set_exclusive(false) {
            debug!("could not clear exclusive flag on {path}: {e}");
        }
    }

    let mut current: Option<bool> = None;
    let mut last_failure_log: Option<Instant> = None;

    while let Some(mut state) = rx.recv().await {
        // Coalesce a burst of queued updates down to the newest.
        while let Ok(newer) = rx.try_recv() {
            state = newer;
        }
        if current == Some(state) {
            continue;
        }

        if let Some(p) = port.as_mut() {
            let byte: &[u8; 1] = if state { b"1" } else { b"0" };
            match p.write_all(byte).await {
                Ok(()) => {
                    current = Some(state);
                }
                Err(e) => {
                    let should_log = last_failure_log
                        .map_or(true, |t| t.elapsed() >= FAILURE_LOG_INTERVAL);
                    if should_log {
                        warn!("LED serial write failed: {e}");
                        last_failure_log = Some(Instant::now());
                    }
                }
            }
        } else {
            current = Some(state);
        }
    }

    // Leave the LED off when shutting down.
    if let Some(p) = port.as_mut() {
        let _ = p.write_all(b"0").await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_gateway_drains_updates() {
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(led_loop(None, rx));
        for state in [true, false, true] {
            tx.send(state).await.unwrap();
        }
        drop(tx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn missing_device_does_not_panic() {
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(led_loop(
            Some("/dev/nonexistent-steadyscript-led".to_string()),
            rx,
        ));
        tx.send(true).await.unwrap();
        drop(tx);
        task.await.unwrap();
    }
}
