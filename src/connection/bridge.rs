//! Local bridge processes.
//!
//! A bridge is a helper process serving the Electrum protocol on top of a Bitcoin Core node. The
//! connection service starts it before connecting and waits for it to report the address it
//! listens on.

use crate::config::BridgeConfig;

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, info};

pub const MULTI_WALLET_REQUIRED: &str =
    "Bitcoin Core requires Multi-Wallet to be enabled in the Server Preferences";
pub const CHECK_BITCOIN_CORE: &str =
    "Check if Bitcoin Core is running, and the authentication details are correct.";

const WALLET_LOADING_FAILED: &str = "Wallet loading failed:";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct BridgeError(pub String);

/// Turn a bridge start failure into a message for the user.
pub fn describe_start_failure(error: Option<&BridgeError>) -> String {
    if let Some(BridgeError(message)) = error {
        if message.contains("Wallet file not specified") {
            return MULTI_WALLET_REQUIRED.to_string();
        }
        if let Some(quoted) = quoted_wallet_loading_error(message) {
            return quoted.to_string();
        }
    }
    CHECK_BITCOIN_CORE.to_string()
}

/// The `"Wallet loading failed: ..."` string quoted inside a backend message
fn quoted_wallet_loading_error(message: &str) -> Option<&str> {
    let start = message.find(&format!("\"{WALLET_LOADING_FAILED}"))? + 1;
    let length = message[start..].find('"')?;
    Some(&message[start..start + length])
}

#[async_trait]
pub trait Bridge: Send + Sync {
    /// Start the bridge. The receiver yields the `host:port` it serves Electrum on once ready.
    fn start(&mut self) -> oneshot::Receiver<Result<String, BridgeError>>;

    fn is_running(&self) -> bool;

    async fn stop(&mut self) -> Result<(), BridgeError>;
}

/// A bridge run as a child process.
///
/// Readiness is signalled by a stdout line containing the configured marker followed by the
/// address. If the process exits first, its stderr becomes the start error.
pub struct ProcessBridge {
    config: BridgeConfig,
    child: Option<Child>,
    running: Arc<AtomicBool>,
}

impl ProcessBridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config, child: None, running: Arc::new(AtomicBool::new(false)) }
    }
}

#[async_trait]
impl Bridge for ProcessBridge {
    fn start(&mut self) -> oneshot::Receiver<Result<String, BridgeError>> {
        let (tx, rx) = oneshot::channel();

        let spawned = Command::new(&self.config.program)
            .args(&self.config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let _ = tx.send(Err(BridgeError(format!("Could not start {}: {e}", self.config.program))));
                return rx;
            }
        };

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = tx.send(Err(BridgeError("Bridge output is not available".to_string())));
            return rx;
        };
        info!("Started bridge {} (pid {:?})", self.config.program, child.id());
        self.child = Some(child);
        self.running.store(true, Ordering::SeqCst);

        let errors = tokio::spawn(async move {
            let mut output = String::new();
            let _ = BufReader::new(stderr).read_to_string(&mut output).await;
            output
        });

        let marker = self.config.ready_marker.clone();
        let running = self.running.clone();
        tokio::spawn(async move {
            let mut ready = Some(tx);
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "bridge", "{}", line);
                if let Some(position) = line.find(&marker) {
                    let address = line[position + marker.len()..].trim().to_string();
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Ok(address));
                    }
                }
            }

            running.store(false, Ordering::SeqCst);
            let output = errors.await.unwrap_or_default();
            if let Some(tx) = ready.take() {
                let message = if output.trim().is_empty() {
                    "Bridge exited before it was ready".to_string()
                } else {
                    output.trim().to_string()
                };
                let _ = tx.send(Err(BridgeError(message)));
            } else {
                info!("Bridge exited");
            }
        });

        rx
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(&mut self) -> Result<(), BridgeError> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(mut child) = self.child.take() {
            child
                .kill()
                .await
                .map_err(|e| BridgeError(format!("Failed to stop bridge: {e}")))?;
            info!("Stopped bridge {}", self.config.program);
        }
        Ok(())
    }
}
