use futures::StreamExt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// What a read from the keeper produced.
#[derive(Debug, PartialEq, Eq)]
pub enum Received {
    Frame(String),
    /// The keeper closed the stream or the transport failed.
    Disconnected,
    /// Shutdown was requested.
    Stopped,
}

/// Dials the keeper, retrying with a fixed backoff until connected or stopped.
pub struct KeeperConnection {
    address: String,
    backoff: Duration,
    stop: watch::Receiver<bool>,
}

impl KeeperConnection {
    pub fn new(address: impl Into<String>, backoff: Duration, stop: watch::Receiver<bool>) -> Self {
        KeeperConnection {
            address: address.into(),
            backoff,
            stop,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Returns `None` once shutdown has been requested.
    pub async fn connect(&mut self) -> Option<KeeperStream> {
        let mut failures: u32 = 0;
        loop {
            if stop_requested(&self.stop) {
                return None;
            }

            let attempt = tokio::select! {
                attempt = connect_async(self.address.as_str()) => attempt,
                _ = self.stop.wait_for(|stopped| *stopped) => return None,
            };

            match attempt {
                Ok((ws, _response)) => {
                    log::info!("Connected to keeper at {}", self.address);
                    return Some(KeeperStream {
                        ws,
                        stop: self.stop.clone(),
                    });
                }
                Err(e) => {
                    failures += 1;
                    if failures <= 3 {
                        log::warn!("Failed to connect to {}: {e}", self.address);
                    } else if failures % 60 == 0 {
                        log::warn!(
                            "Still unable to connect to {} after {failures} attempts: {e}",
                            self.address
                        );
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.backoff) => {}
                _ = self.stop.wait_for(|stopped| *stopped) => return None,
            }
        }
    }
}

/// One established keeper connection. The client only ever reads from it.
pub struct KeeperStream {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    stop: watch::Receiver<bool>,
}

impl KeeperStream {
    pub async fn next_frame(&mut self) -> Received {
        loop {
            let message = tokio::select! {
                message = self.ws.next() => message,
                _ = self.stop.wait_for(|stopped| *stopped) => return Received::Stopped,
            };

            match message {
                Some(Ok(Message::Text(text))) => return Received::Frame(text),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => return Received::Frame(text),
                    Err(_) => log::warn!("Ignoring binary frame that is not UTF-8"),
                },
                Some(Ok(Message::Close(frame))) => {
                    log::info!("Keeper closed the connection: {frame:?}");
                    return Received::Disconnected;
                }
                Some(Ok(_)) => {} // ping/pong, answered by tungstenite
                Some(Err(e)) => {
                    log::warn!("Keeper read error: {e}");
                    return Received::Disconnected;
                }
                None => return Received::Disconnected,
            }
        }
    }

    /// Sends a close frame and drops the connection.
    pub async fn close(mut self) {
        if let Err(e) = self.ws.close(None).await {
            log::debug!("Close handshake with keeper failed: {e}");
        }
    }
}

/// A dropped sender counts as a stop request.
fn stop_requested(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow() || stop.has_changed().is_err()
}
