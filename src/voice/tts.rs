//! Streaming speech synthesis client
//!
//! Holds a WebSocket connection to a streaming synthesis service (Deepgram
//! Aura). Text goes out sentence by sentence; synthesized audio comes back as
//! binary frames on a typed event channel. Flush acknowledgements are counted
//! on a watch channel so a caller can wait for every outstanding flush
//! without racing the receive loop.

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use super::{VoiceError, WsSink, WsSource};
use crate::config::TtsConfig;

/// Synthesis events delivered to the consumer
#[derive(Debug, Clone)]
pub enum TtsEvent {
    /// A chunk of synthesized audio
    Audio(Vec<u8>),
    /// The service finished synthesizing everything sent before a flush
    Flushed,
    /// A service-reported or connection error
    Error(String),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum TtsFrame {
    Flushed,
    Error {
        #[serde(default)]
        description: String,
    },
    #[serde(other)]
    Other,
}

/// Streaming synthesis connection
///
/// One connection serves one response. The orchestrator opens a fresh client
/// per response task and force-closes it on interruption.
pub struct SpeechSynthesisClient {
    sink: WsSink,
    receive_task: JoinHandle<()>,
    connected: Arc<AtomicBool>,
    /// Outstanding flush requests not yet acknowledged by the service
    pending_flushes: Arc<watch::Sender<usize>>,
}

impl SpeechSynthesisClient {
    /// Connect to the synthesis service and start the receive loop.
    pub async fn connect(
        config: &TtsConfig,
        events: mpsc::Sender<TtsEvent>,
    ) -> Result<Self, VoiceError> {
        let api_key = config
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| VoiceError::Startup("DEEPGRAM_API_KEY is not set".to_string()))?;

        let url = format!(
            "{}?model={}&encoding={}&sample_rate={}",
            config.url, config.voice, config.encoding, config.sample_rate,
        );

        let mut request = url
            .into_client_request()
            .map_err(|e| VoiceError::Startup(format!("invalid TTS endpoint: {}", e)))?;
        let auth = HeaderValue::from_str(&format!("Token {}", api_key))
            .map_err(|e| VoiceError::Startup(format!("invalid API key: {}", e)))?;
        request.headers_mut().insert("Authorization", auth);

        let (ws, _) = connect_async(request)
            .await
            .map_err(|e| VoiceError::Startup(format!("TTS connection failed: {}", e)))?;
        info!("Connected to TTS stream");

        let (sink, source) = ws.split();
        let connected = Arc::new(AtomicBool::new(true));
        let (flush_tx, _) = watch::channel(0usize);
        let pending_flushes = Arc::new(flush_tx);
        let receive_task = tokio::spawn(receive_loop(
            source,
            events,
            connected.clone(),
            pending_flushes.clone(),
        ));

        Ok(Self {
            sink,
            receive_task,
            connected,
            pending_flushes,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Queue text for synthesis.
    pub async fn send_text(&mut self, text: &str) -> Result<(), VoiceError> {
        let frame = json!({ "type": "Speak", "text": text }).to_string();
        self.sink
            .send(WsMessage::Text(frame.into()))
            .await
            .map_err(|e| VoiceError::TransportSend(format!("text send failed: {}", e)))
    }

    /// Ask the service to synthesize everything queued so far.
    pub async fn flush(&mut self) -> Result<(), VoiceError> {
        self.pending_flushes.send_modify(|count| *count += 1);
        let result = self
            .sink
            .send(WsMessage::Text(r#"{"type":"Flush"}"#.into()))
            .await
            .map_err(|e| VoiceError::TransportSend(format!("flush send failed: {}", e)));
        if result.is_err() {
            self.pending_flushes.send_modify(|count| *count = count.saturating_sub(1));
        }
        result
    }

    /// Observer for the outstanding-flush count. Reaches zero when every
    /// requested flush has been acknowledged; the channel closes if the
    /// connection is torn down first.
    pub fn flush_watch(&self) -> watch::Receiver<usize> {
        self.pending_flushes.subscribe()
    }

    /// Flush and wait for every outstanding acknowledgement, up to `timeout`.
    /// A timeout is logged and tolerated; the audio already delivered stands.
    pub async fn flush_and_wait(&mut self, timeout: Duration) -> Result<(), VoiceError> {
        self.flush().await?;
        let mut watch = self.flush_watch();
        match tokio::time::timeout(timeout, watch.wait_for(|count| *count == 0)).await {
            Ok(Ok(_)) => debug!("All synthesis flushes acknowledged"),
            // Sender dropped means the connection closed under us
            Ok(Err(_)) => debug!("TTS connection closed while waiting for flush"),
            Err(_) => warn!("Timed out waiting for synthesis flush after {:?}", timeout),
        }
        Ok(())
    }

    /// Close the connection. A forced close aborts the receive loop and
    /// returns promptly without waiting for outstanding audio; a graceful
    /// close tells the service to finish first.
    pub async fn close(&mut self, force: bool) {
        self.connected.store(false, Ordering::SeqCst);
        self.receive_task.abort();

        if !force {
            if let Err(e) = self.sink.send(WsMessage::Text(r#"{"type":"Close"}"#.into())).await {
                debug!("TTS close frame not delivered: {}", e);
            }
        }
        let close = self.sink.close();
        if force {
            // Bounded: an interrupt must not wait on a slow socket
            let _ = tokio::time::timeout(Duration::from_millis(50), close).await;
        } else if let Err(e) = close.await {
            debug!("TTS socket close failed: {}", e);
        }
        info!("Closed TTS connection (force: {})", force);
    }
}

async fn receive_loop(
    mut source: WsSource,
    events: mpsc::Sender<TtsEvent>,
    connected: Arc<AtomicBool>,
    pending_flushes: Arc<watch::Sender<usize>>,
) {
    while let Some(message) = source.next().await {
        if !connected.load(Ordering::SeqCst) {
            break;
        }
        match message {
            Ok(WsMessage::Binary(data)) => {
                if events.send(TtsEvent::Audio(data.to_vec())).await.is_err() {
                    break;
                }
            }
            Ok(WsMessage::Text(text)) => match serde_json::from_str::<TtsFrame>(&text) {
                Ok(TtsFrame::Flushed) => {
                    pending_flushes.send_modify(|count| *count = count.saturating_sub(1));
                    if events.send(TtsEvent::Flushed).await.is_err() {
                        break;
                    }
                }
                Ok(TtsFrame::Error { description }) => {
                    error!("TTS service error: {}", description);
                    if events.send(TtsEvent::Error(description)).await.is_err() {
                        break;
                    }
                }
                Ok(TtsFrame::Other) => {}
                Err(e) => {
                    let err = VoiceError::MalformedMessage(e.to_string());
                    warn!("Dropping TTS frame: {}", err);
                }
            },
            Ok(WsMessage::Close(_)) => {
                info!("TTS stream closed by service");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!("TTS receive failed: {}", e);
                let _ = events.send(TtsEvent::Error(e.to_string())).await;
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flushed_frame_parses() {
        let frame: TtsFrame = serde_json::from_str(r#"{"type":"Flushed","sequence_id":3}"#).unwrap();
        assert!(matches!(frame, TtsFrame::Flushed));
    }

    #[test]
    fn test_error_frame_parses() {
        let frame: TtsFrame =
            serde_json::from_str(r#"{"type":"Error","description":"over quota"}"#).unwrap();
        match frame {
            TtsFrame::Error { description } => assert_eq!(description, "over quota"),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_metadata_frame_ignored() {
        let frame: TtsFrame =
            serde_json::from_str(r#"{"type":"Metadata","model_name":"aura-2"}"#).unwrap();
        assert!(matches!(frame, TtsFrame::Other));
    }

    #[tokio::test]
    async fn test_flush_watch_counts_down() {
        let (tx, _) = watch::channel(2usize);
        let tx = Arc::new(tx);
        let mut rx = tx.subscribe();

        let counter = tx.clone();
        tokio::spawn(async move {
            counter.send_modify(|c| *c -= 1);
            counter.send_modify(|c| *c -= 1);
        });

        let settled = tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|c| *c == 0)).await;
        assert!(settled.is_ok());
    }

    #[tokio::test]
    async fn test_partial_acknowledgments_time_out() {
        // Two flushes queued, only one ever acknowledged: the wait must give
        // up at the timeout instead of unblocking on the first ack
        let (tx, _) = watch::channel(2usize);
        let tx = Arc::new(tx);
        let mut rx = tx.subscribe();

        tx.send_modify(|c| *c -= 1);

        let settled =
            tokio::time::timeout(Duration::from_millis(50), rx.wait_for(|c| *c == 0)).await;
        assert!(settled.is_err());
        assert_eq!(*tx.borrow(), 1);
    }
}
