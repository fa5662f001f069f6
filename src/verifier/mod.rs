/// Verification notifier
///
/// Listens to each environment's verifier feed and reports ready emails to a
/// `VerificationListener`. Frames are JSON text:
/// - `{"event":"ready","email":"...","token":"..."}`
/// - `{"event":"error","detail":"..."}`
///
/// Transport failures are reported through `on_error` and never reach
/// in-flight requests; the connection is retried after a fixed back-off.

use crate::config::ServerEnv;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Default reconnect back-off in seconds
pub const DEFAULT_RECONNECT_SECS: u64 = 5;

/// Receiver of verification events
pub trait VerificationListener: Send + Sync {
    /// `email` finished verification; duplicates must be harmless
    fn on_ready(&self, email: &str, token: Option<String>);

    /// Transport-level failure
    fn on_error(&self, detail: &str);
}

/// One frame from a verifier feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum VerifierMessage {
    Ready {
        email: String,
        #[serde(default)]
        token: Option<String>,
    },
    Error {
        detail: String,
    },
}

/// Parse a text frame and hand it to the listener
pub fn dispatch_frame(env: ServerEnv, text: &str, listener: &dyn VerificationListener) {
    match serde_json::from_str::<VerifierMessage>(text) {
        Ok(VerifierMessage::Ready { email, token }) => {
            debug!(env = %env, email = %email, "Verifier reported ready");
            listener.on_ready(&email, token);
        }
        Ok(VerifierMessage::Error { detail }) => {
            listener.on_error(&format!("{} verifier: {}", env, detail));
        }
        Err(e) => {
            listener.on_error(&format!("{} verifier sent unparseable frame: {}", env, e));
        }
    }
}

/// Verifier feed endpoint for one environment
#[derive(Debug, Clone)]
pub struct VerifierEndpoint {
    pub env: ServerEnv,
    pub url: String,
}

/// WebSocket client for the verifier feeds
pub struct WebSocketNotifier {
    endpoints: Vec<VerifierEndpoint>,
    reconnect_interval: Duration,
    listener: Arc<dyn VerificationListener>,
}

impl WebSocketNotifier {
    pub fn new(endpoints: Vec<VerifierEndpoint>, listener: Arc<dyn VerificationListener>) -> Self {
        Self {
            endpoints,
            reconnect_interval: Duration::from_secs(DEFAULT_RECONNECT_SECS),
            listener,
        }
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn endpoints(&self) -> &[VerifierEndpoint] {
        &self.endpoints
    }

    /// Spawn one connection task per endpoint
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        if self.endpoints.is_empty() {
            info!("No verifier feeds configured; verified accounts will time out");
        }

        self.endpoints
            .iter()
            .cloned()
            .map(|endpoint| {
                let listener = Arc::clone(&self.listener);
                let reconnect_interval = self.reconnect_interval;
                tokio::spawn(async move {
                    Self::run_feed(endpoint, listener, reconnect_interval).await;
                })
            })
            .collect()
    }

    /// Connect to one feed and forward its frames, forever
    async fn run_feed(
        endpoint: VerifierEndpoint,
        listener: Arc<dyn VerificationListener>,
        reconnect_interval: Duration,
    ) {
        let ws_url = endpoint
            .url
            .replace("https://", "wss://")
            .replace("http://", "ws://");

        loop {
            info!("Connecting to {} verifier: {}", endpoint.env, ws_url);

            match connect_async(ws_url.as_str()).await {
                Ok((mut ws_stream, _)) => {
                    info!("✓ Connected to {} verifier", endpoint.env);

                    while let Some(msg) = ws_stream.next().await {
                        match msg {
                            Ok(Message::Text(text)) => {
                                dispatch_frame(endpoint.env, &text, listener.as_ref());
                            }
                            Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                                Ok(text) => dispatch_frame(endpoint.env, text, listener.as_ref()),
                                Err(_) => warn!("Ignoring non-UTF-8 verifier frame"),
                            },
                            Ok(Message::Ping(data)) => {
                                if let Err(e) = ws_stream.send(Message::Pong(data)).await {
                                    listener.on_error(&format!("Failed to send pong: {}", e));
                                    break;
                                }
                            }
                            Ok(Message::Close(_)) => {
                                info!("{} verifier closed connection", endpoint.env);
                                break;
                            }
                            Ok(_) => {}
                            Err(e) => {
                                listener.on_error(&format!(
                                    "{} verifier socket error: {}",
                                    endpoint.env, e
                                ));
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    listener.on_error(&format!(
                        "Failed to connect to {} verifier {}: {}",
                        endpoint.env, ws_url, e
                    ));
                }
            }

            debug!("Reconnecting in {:?}", reconnect_interval);
            tokio::time::sleep(reconnect_interval).await;
        }
    }
}
