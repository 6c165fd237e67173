//! ビューワ hub へのリアルタイム送信チャネル
//!
//! WebSocket 通信は独立した tokio タスクで動き、受信イベントのキューと
//! 上限付きの送信キューでチャネルとやり取りする。
//! [`PushChannel::dispatch`] が毎tickイベントを処理して [`Session`] を進める。
//! 送信はソケットを待たず、キューが埋まっていればフレームを捨てる。

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::mpsc::{self, Receiver, Sender, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;

use super::frame::{FrameBuffer, StreamState};

/// 未送信で保持するメッセージ数の上限。hub が読まなければ以降のフレームは捨てる
pub const OUTBOUND_CAPACITY: usize = 2;

// --- Messages ---

#[derive(Debug, Clone, Serialize)]
pub struct Capabilities {
    pub resolution: String,
    pub fps: u32,
    pub compression: &'static str,
}

/// 接続直後に送る登録メッセージ
#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub version: &'static str,
    pub capabilities: Capabilities,
}

impl Registration {
    pub fn new(resolution: String, fps: u32, compression: &'static str) -> Self {
        Self {
            kind: "unity_bitmap_streamer",
            version: "1.0",
            capabilities: Capabilities {
                resolution,
                fps,
                compression,
            },
        }
    }
}

/// 各バイナリフレームの直前に送るテキスト
#[derive(Debug, Clone, Serialize)]
pub struct FrameHeader {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub frame_number: u64,
    pub timestamp: f64,
    pub resolution: String,
    pub compression: &'static str,
    pub size: usize,
}

impl FrameHeader {
    pub fn new(frame: &FrameBuffer, resolution: String, compression: &'static str) -> Self {
        Self {
            kind: "bitmap_frame",
            frame_number: frame.frame_number,
            timestamp: frame.timestamp,
            resolution,
            compression,
            size: frame.encoded.len(),
        }
    }
}

/// hub から届くメッセージ
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    RegistrationConfirmed {
        #[serde(default)]
        client_id: String,
        #[serde(default)]
        web_clients_count: u32,
    },
    ClientCount {
        #[serde(default)]
        count: u32,
    },
    Error {
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Error)]
pub enum InboundError {
    #[error("message is not UTF-8: {0}")]
    NotUtf8(#[from] std::str::Utf8Error),
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub fn parse_inbound(data: &[u8]) -> Result<Inbound, InboundError> {
    let text = std::str::from_utf8(data)?;
    Ok(serde_json::from_str(text)?)
}

// --- Session ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Registered,
    Streaming,
}

/// push チャネルの接続・登録状態
#[derive(Debug, Clone)]
pub struct Session {
    state: SessionState,
    client_id: Option<String>,
    viewer_count: u32,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            state: SessionState::Disconnected,
            client_id: None,
            viewer_count: 0,
        }
    }
}

impl Session {
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn viewer_count(&self) -> u32 {
        self.viewer_count
    }

    pub fn is_connected(&self) -> bool {
        self.state >= SessionState::Connected
    }

    pub fn is_registered(&self) -> bool {
        self.state >= SessionState::Registered
    }

    pub fn is_streaming(&self) -> bool {
        self.state == SessionState::Streaming
    }

    /// 切断中のときだけ接続を始められる
    pub fn begin_connect(&mut self) -> bool {
        if self.state != SessionState::Disconnected {
            return false;
        }
        self.state = SessionState::Connecting;
        true
    }

    pub fn on_open(&mut self) {
        if self.state == SessionState::Connecting {
            self.state = SessionState::Connected;
        }
    }

    pub fn on_inbound(&mut self, message: &Inbound) {
        match message {
            Inbound::RegistrationConfirmed {
                client_id,
                web_clients_count,
            } => {
                if !self.is_connected() {
                    tracing::warn!("push: registration confirmed while {:?}, ignored", self.state);
                    return;
                }
                self.client_id = Some(client_id.clone());
                self.viewer_count = *web_clients_count;
                self.state = SessionState::Registered;
                tracing::info!(
                    "push: registered as {client_id}, {web_clients_count} viewers connected"
                );
                self.start_streaming();
            }
            Inbound::ClientCount { count } => {
                self.viewer_count = *count;
                tracing::debug!("push: viewers {count}");
            }
            Inbound::Error { message } => {
                tracing::warn!("push: hub error: {message}");
            }
            Inbound::Other => {}
        }
    }

    /// 通信が閉じた・失敗した: どの状態からでも切断へ
    pub fn on_closed(&mut self) {
        *self = Self::default();
    }

    pub fn start_streaming(&mut self) -> bool {
        if self.is_registered() {
            self.state = SessionState::Streaming;
            true
        } else {
            false
        }
    }

    pub fn stop_streaming(&mut self) {
        if self.state == SessionState::Streaming {
            self.state = SessionState::Registered;
        }
    }
}

// --- Transport ---

#[derive(Debug)]
pub enum TransportEvent {
    Opened,
    Message(Vec<u8>),
    Closed(Option<String>),
    Error(String),
}

#[derive(Debug)]
pub enum Outbound {
    Text(String),
    /// ヘッダ (text) とペイロード (binary) の組。必ず続けて送る
    Frame { header: String, payload: Bytes },
}

async fn run_transport(
    url: String,
    events: UnboundedSender<TransportEvent>,
    mut outbound: Receiver<Outbound>,
    mut close: oneshot::Receiver<()>,
) {
    let ws = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            let _ = events.send(TransportEvent::Error(format!("connect {url}: {e}")));
            return;
        }
    };
    let _ = events.send(TransportEvent::Opened);
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            _ = &mut close => {
                let _ = sink.send(Message::Close(None)).await;
                let _ = events.send(TransportEvent::Closed(None));
                return;
            }
            out = outbound.recv() => {
                let result = match out {
                    Some(Outbound::Text(text)) => sink.send(Message::Text(text)).await,
                    Some(Outbound::Frame { header, payload }) => {
                        match sink.send(Message::Text(header)).await {
                            Ok(()) => {
                                // hub は到着順でヘッダとペイロードを対応付ける
                                tokio::task::yield_now().await;
                                sink.send(Message::Binary(payload.to_vec())).await
                            }
                            Err(e) => Err(e),
                        }
                    }
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        let _ = events.send(TransportEvent::Closed(None));
                        return;
                    }
                };
                if let Err(e) = result {
                    let _ = events.send(TransportEvent::Error(format!("send: {e}")));
                    return;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(TransportEvent::Message(text.into_bytes()));
                }
                Some(Ok(Message::Binary(data))) => {
                    let _ = events.send(TransportEvent::Message(data));
                }
                Some(Ok(Message::Close(frame))) => {
                    let _ = events.send(TransportEvent::Closed(frame.map(|f| f.reason.to_string())));
                    return;
                }
                // ping/pong は tungstenite が処理する
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = events.send(TransportEvent::Error(format!("receive: {e}")));
                    return;
                }
                None => {
                    let _ = events.send(TransportEvent::Closed(None));
                    return;
                }
            }
        }
    }
}

/// キャプチャ側がフレームを投げるためのハンドル。送信完了は待たない
#[derive(Clone)]
pub struct FrameSender {
    outbound: Sender<Outbound>,
    state: Arc<StreamState>,
}

impl FrameSender {
    /// hub に接続済みかつ登録済み
    pub fn is_ready(&self) -> bool {
        self.state.is_connected() && self.state.is_registered() && !self.outbound.is_closed()
    }

    /// ヘッダとペイロードを一組でキューに積む。満杯か切断済みなら捨てて false
    pub fn send_frame(&self, header: String, payload: Bytes) -> bool {
        match self.outbound.try_send(Outbound::Frame { header, payload }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!("push: hub is not keeping up, frame dropped");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// キューに積まれたまま未送信のメッセージ数
    pub fn backlog(&self) -> usize {
        self.outbound.max_capacity() - self.outbound.capacity()
    }
}

struct Link {
    outbound: Sender<Outbound>,
    events: UnboundedReceiver<TransportEvent>,
    close: oneshot::Sender<()>,
}

impl Link {
    fn close(self) {
        let _ = self.close.send(());
    }
}

pub struct PushChannel {
    url: String,
    session: Session,
    state: Arc<StreamState>,
    link: Option<Link>,
}

impl PushChannel {
    pub fn new(url: impl Into<String>, state: Arc<StreamState>) -> Self {
        Self {
            url: url.into(),
            session: Session::default(),
            state,
            link: None,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// バックグラウンドで接続する。tokio ランタイム内で呼ぶこと
    pub fn connect(&mut self) {
        if !self.session.begin_connect() {
            tracing::warn!("push: already {:?}, connect ignored", self.session.state());
            return;
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (close_tx, close_rx) = oneshot::channel();
        tokio::spawn(run_transport(self.url.clone(), events_tx, outbound_rx, close_rx));
        self.link = Some(Link {
            outbound: outbound_tx,
            events: events_rx,
            close: close_tx,
        });
        tracing::info!("push: connecting to {}", self.url);
        self.sync_flags();
    }

    /// 切断する。戻る前にセッション状態はリセット済み
    pub fn disconnect(&mut self) {
        if let Some(link) = self.link.take() {
            link.close();
        }
        if self.session.state() != SessionState::Disconnected {
            tracing::info!("push: disconnected");
        }
        self.session.on_closed();
        self.sync_flags();
    }

    pub fn sender(&self) -> Option<FrameSender> {
        self.link.as_ref().map(|link| FrameSender {
            outbound: link.outbound.clone(),
            state: Arc::clone(&self.state),
        })
    }

    pub fn start_streaming(&mut self) -> bool {
        let started = self.session.start_streaming();
        self.sync_flags();
        started
    }

    pub fn stop_streaming(&mut self) {
        self.session.stop_streaming();
        self.sync_flags();
    }

    /// 前回以降に届いたイベントを全て処理する
    pub fn dispatch(&mut self) {
        loop {
            let event = match self.link.as_mut().map(|l| l.events.try_recv()) {
                Some(Ok(event)) => event,
                Some(Err(TryRecvError::Disconnected)) => TransportEvent::Closed(None),
                Some(Err(TryRecvError::Empty)) | None => break,
            };
            self.handle(event);
        }
        self.sync_flags();
    }

    fn handle(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => {
                self.session.on_open();
                tracing::info!("push: connected to {}", self.url);
                let registration = Registration::new(
                    self.state.resolution_label(),
                    self.state.target_fps(),
                    self.state.compression_label(),
                );
                match serde_json::to_string(&registration) {
                    Ok(json) => {
                        if let Some(link) = &self.link {
                            if link.outbound.try_send(Outbound::Text(json)).is_err() {
                                tracing::warn!("push: registration could not be queued");
                            }
                        }
                    }
                    Err(e) => tracing::error!("push: failed to encode registration: {e}"),
                }
            }
            TransportEvent::Message(data) => match parse_inbound(&data) {
                Ok(message) => self.session.on_inbound(&message),
                Err(e) => tracing::warn!("push: dropped inbound message: {e}"),
            },
            TransportEvent::Closed(reason) => {
                tracing::info!(
                    "push: disconnected from server: {}",
                    reason.as_deref().unwrap_or("closed")
                );
                self.teardown();
            }
            TransportEvent::Error(e) => {
                tracing::warn!("push: transport error: {e}");
                self.teardown();
            }
        }
    }

    // 自動再接続はしない
    fn teardown(&mut self) {
        self.link = None;
        self.session.on_closed();
    }

    fn sync_flags(&self) {
        self.state.set_session_flags(
            self.session.is_connected(),
            self.session.is_registered(),
            self.session.is_streaming(),
        );
    }

    #[cfg(test)]
    fn attach_fake(&mut self) -> FakeTransport {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (close_tx, close_rx) = oneshot::channel();
        self.session.begin_connect();
        self.link = Some(Link {
            outbound: outbound_tx,
            events: events_rx,
            close: close_tx,
        });
        FakeTransport {
            events: events_tx,
            outbound: outbound_rx,
            close: close_rx,
        }
    }
}

impl Drop for PushChannel {
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            link.close();
        }
    }
}

/// 読み取りを一切しない hub の代わり
#[cfg(test)]
struct FakeTransport {
    events: UnboundedSender<TransportEvent>,
    outbound: Receiver<Outbound>,
    close: oneshot::Receiver<()>,
}
