//! ndtp-test-server: an NDTP server stand-in for testing telemetry clients
//!
//! Tracking devices connect over TCP, send a handshake and then a stream of
//! navigation packets. The server acknowledges every packet and, depending on
//! the mode:
//! - `echo`: does nothing else
//! - `control`: sends one control packet when a device's stream ends
//! - `stats`: aggregates traffic counters and logs them periodically
//!
//! With a packet quota each connection is closed after that many packets and
//! the server exits once every connection is done. Otherwise it runs until
//! Ctrl-C, then waits for open connections to finish.

mod codec;
mod config;
mod framer;
mod protocols;
mod server;
mod session;
mod stats;

use config::{Config, Mode};
use protocols::ndtp::NdtpCodec;
use server::Shutdown;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        mode = ?config.mode,
        quota = ?config.quota,
        read_timeout_secs = config.read_timeout.as_secs(),
        "Starting NDTP test server"
    );

    let shutdown = Shutdown::new();
    spawn_signal_handler(shutdown.clone());

    let (stats, aggregator) = if config.mode == Mode::Stats {
        let (sender, handle) = stats::spawn(config.report_interval);
        (Some(sender), Some(handle))
    } else {
        (None, None)
    };

    let results = match server::serve(&config, NdtpCodec, stats, shutdown).await {
        Ok(results) => results,
        Err(e) => {
            error!(error = %e, "Server failed to start");
            return Err(e.into());
        }
    };

    if let Some(aggregator) = aggregator {
        aggregator.await?;
    }

    for r in &results {
        info!(
            conn = r.conn_id,
            received = r.received,
            acks = r.acks_sent,
            control = r.control_sent,
            control_failed = r.control_failed,
            end = ?r.end,
            "Connection summary"
        );
    }

    Ok(())
}

/// Exit status for an interrupted process (128 + SIGINT).
const FORCED_EXIT_CODE: i32 = 130;

/// Turn the first Ctrl-C into a graceful stop and a second one into an
/// immediate exit.
fn spawn_signal_handler(shutdown: Shutdown) {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    if tx.send(()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Cannot listen for Ctrl-C");
                    break;
                }
            }
        }
    });

    tokio::spawn(async move {
        if interrupted_twice(&shutdown, rx).await {
            warn!("Second Ctrl-C received, exiting without waiting for sessions");
            std::process::exit(FORCED_EXIT_CODE);
        }
    });
}

/// Trigger `shutdown` on the first interrupt; true once a second arrives.
async fn interrupted_twice(
    shutdown: &Shutdown,
    mut interrupts: mpsc::UnboundedReceiver<()>,
) -> bool {
    if interrupts.recv().await.is_none() {
        return false;
    }
    info!("Ctrl-C received, no longer accepting connections (press again to force exit)");
    shutdown.trigger();
    interrupts.recv().await.is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_interrupt_stops_gracefully() {
        let shutdown = Shutdown::new();
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(()).unwrap();
        drop(tx);

        assert!(!interrupted_twice(&shutdown, rx).await);
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_second_interrupt_forces_exit() {
        let shutdown = Shutdown::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { interrupted_twice(&shutdown, rx).await })
        };

        tx.send(()).unwrap();
        shutdown.triggered().await;
        assert!(!waiter.is_finished());

        tx.send(()).unwrap();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_no_interrupt_no_stop() {
        let shutdown = Shutdown::new();
        let (tx, rx) = mpsc::unbounded_channel::<()>();
        drop(tx);

        assert!(!interrupted_twice(&shutdown, rx).await);
        assert!(!shutdown.is_triggered());
    }
}
