use std::sync::Arc;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

use crate::protocol::ServerEvent;
use crate::transport::{LinkState, Transport, TransportError, wait_for_state};

type Inbound = Result<Bytes, TransportError>;

/// Endpoint and credentials for the realtime WebSocket.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub ws_url: String,
    pub token: String,
    pub model: String,
}

/// [`Transport`] over a realtime WebSocket.
///
/// Connects in the background: the link starts `Connecting`, becomes `Open`
/// after the handshake and `Closed` when either side hangs up.
pub struct WebSocketTransport {
    cmd_tx: mpsc::Sender<Message>,
    inbound: Mutex<mpsc::UnboundedReceiver<Inbound>>,
    state_tx: Arc<watch::Sender<LinkState>>,
    task: JoinHandle<()>,
}

impl WebSocketTransport {
    pub fn spawn(config: LinkConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel::<Message>(100);
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Inbound>();
        let (state_tx, _) = watch::channel(LinkState::Connecting);
        let state_tx = Arc::new(state_tx);

        let task = {
            let state_tx = state_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = connect_and_loop(&config, cmd_rx, in_tx, &state_tx).await {
                    log::error!("Realtime link error: {}", e);
                }
                state_tx.send_replace(LinkState::Closed);
            })
        };

        Self {
            cmd_tx,
            inbound: Mutex::new(in_rx),
            state_tx,
            task,
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn state(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        let state = *self.state_tx.borrow();
        match state {
            LinkState::Open => {}
            LinkState::Connecting => return Err(TransportError::NotOpen),
            LinkState::Closed => return Err(TransportError::Closed),
        }
        self.cmd_tx
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&self) -> Result<Bytes, TransportError> {
        let mut state = self.state_tx.subscribe();
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            biased;
            packet = inbound.recv() => packet.unwrap_or(Err(TransportError::Closed)),
            _ = wait_for_state(&mut state, LinkState::Closed) => Err(TransportError::Closed),
        }
    }

    async fn close(&self) {
        let previous = self.state_tx.send_replace(LinkState::Closed);
        if previous != LinkState::Closed {
            let _ = self.cmd_tx.try_send(Message::Close(None));
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Build the upgrade request with bearer auth and the realtime beta header.
pub fn build_request(config: &LinkConfig) -> anyhow::Result<Request<()>> {
    let mut url = Url::parse(&config.ws_url)?;
    if !config.model.is_empty() && !url.query_pairs().any(|(k, _)| k == "model") {
        url.query_pairs_mut().append_pair("model", &config.model);
    }
    let host = url
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("WebSocket URL has no host: {}", config.ws_url))?
        .to_string();

    let request = Request::builder()
        .method("GET")
        .uri(url.as_str())
        .header("Host", host)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header(
            "Sec-WebSocket-Key",
            tokio_tungstenite::tungstenite::handshake::client::generate_key(),
        )
        .header("Authorization", format!("Bearer {}", config.token))
        .header("OpenAI-Beta", "realtime=v1")
        .body(())?;
    Ok(request)
}

/// Turn a server text event into an inbound packet, if it carries audio.
pub fn packet_from_text(text: &str) -> Option<Inbound> {
    let event = match ServerEvent::parse(text) {
        Ok(event) => event,
        Err(e) => return Some(Err(TransportError::Protocol(e.to_string()))),
    };

    if event.is_audio_delta() {
        let delta = event.delta.unwrap_or_default();
        return Some(
            STANDARD
                .decode(delta.as_bytes())
                .map(Bytes::from)
                .map_err(|e| TransportError::Protocol(format!("bad audio delta: {}", e))),
        );
    }

    if event.is_error() {
        let message = event
            .error
            .and_then(|e| e.message)
            .unwrap_or_else(|| "unknown error".to_string());
        log::warn!("Realtime server error: {}", message);
    } else {
        log::debug!("Realtime event: {}", event.event_type);
    }
    None
}

// 建立连接并进入主循环，处理WebSocket消息和发送命令
async fn connect_and_loop(
    config: &LinkConfig,
    mut cmd_rx: mpsc::Receiver<Message>,
    in_tx: mpsc::UnboundedSender<Inbound>,
    state_tx: &watch::Sender<LinkState>,
) -> anyhow::Result<()> {
    let request = build_request(config)?;

    log::info!("Connecting to {}...", config.ws_url);
    let (ws_stream, _) = connect_async(request).await?;

    // 握手期间可能已经调用过 close()
    let state = *state_tx.borrow();
    if state == LinkState::Closed {
        return Ok(());
    }
    state_tx.send_replace(LinkState::Open);
    log::info!("Realtime link open");

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(packet) = packet_from_text(text.as_str()) {
                            if in_tx.send(packet).is_err() {
                                return Ok(());
                            }
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if in_tx.send(Ok(Bytes::copy_from_slice(&data))).is_err() {
                            return Ok(());
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        log::info!("Server closed connection: {:?}", frame);
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(()),
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Message::Close(frame)) => {
                        let _ = write.send(Message::Close(frame)).await;
                        return Ok(());
                    }
                    Some(msg) => write.send(msg).await?,
                    None => return Ok(()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str) -> LinkConfig {
        LinkConfig {
            ws_url: url.to_string(),
            token: "sk-test".to_string(),
            model: "gpt-4o-realtime-preview".to_string(),
        }
    }

    #[test]
    fn request_carries_auth_and_model() {
        let request = build_request(&config("wss://api.openai.com/v1/realtime")).unwrap();
        assert_eq!(
            request.uri().to_string(),
            "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview"
        );
        assert_eq!(request.headers()["Authorization"], "Bearer sk-test");
        assert_eq!(request.headers()["OpenAI-Beta"], "realtime=v1");
        assert_eq!(request.headers()["Host"], "api.openai.com");
    }

    #[test]
    fn explicit_model_in_url_is_kept() {
        let request = build_request(&config("wss://example.com/rt?model=custom")).unwrap();
        assert_eq!(request.uri().to_string(), "wss://example.com/rt?model=custom");
    }

    #[test]
    fn audio_delta_becomes_packet() {
        let packet = packet_from_text(r#"{"type":"response.audio.delta","delta":"AQID"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(packet, Bytes::from_static(&[1, 2, 3]));
    }

    #[test]
    fn other_events_are_not_packets() {
        assert!(packet_from_text(r#"{"type":"session.updated"}"#).is_none());
        assert!(packet_from_text(r#"{"type":"error","error":{"message":"nope"}}"#).is_none());
    }

    #[test]
    fn malformed_input_is_a_protocol_error() {
        let err = packet_from_text("not json").unwrap().unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
        let err = packet_from_text(r#"{"type":"response.audio.delta","delta":"@@@"}"#)
            .unwrap()
            .unwrap_err();
        assert!(!err.is_terminal());
    }

    #[tokio::test]
    async fn unreachable_endpoint_ends_closed() {
        let transport = WebSocketTransport::spawn(config("ws://127.0.0.1:9/realtime"));
        let mut state = transport.state();
        assert!(wait_for_state(&mut state, LinkState::Closed).await);
        assert_eq!(
            transport.send_text("{}".into()).await,
            Err(TransportError::Closed)
        );
        assert_eq!(transport.recv().await, Err(TransportError::Closed));
    }
}
