use crate::protocol::{self, Envelope};
use crate::session::{SessionWatch, UiMode};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Lifecycle and traffic events an adapter reports to its single consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Opened,
    Message(String),
    Error(String),
    Closed,
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Duplex message channel to the device controller. Pluggable so the whole
/// dispatcher can run against the scripted mock without a live backend.
pub trait Transport: Send + Sync {
    /// Begin connecting. A call while already connected or connecting is a
    /// no-op.
    fn connect(&self);
    /// Queue one frame. Returns false, without blocking, when the link is
    /// not connected.
    fn send(&self, frame: &str) -> bool;
    /// Tear the link down and clear any pending retry.
    fn disconnect(&self);
    fn is_connected(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Disconnected,
    Connecting,
    Connected,
}

/// Single-slot retry timer with a fixed backoff interval. A second schedule
/// while one is pending is dropped; `invalidate` keeps an already-armed
/// timer from reconnecting after an intentional shutdown.
pub struct ReconnectPolicy {
    delay: Duration,
    pending: AtomicBool,
    generation: AtomicU64,
}

impl ReconnectPolicy {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            pending: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn schedule<F>(self: Arc<Self>, reconnect: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.pending.swap(true, Ordering::SeqCst) {
            tracing::debug!("reconnect already pending");
            return;
        }
        let generation = self.generation();
        tokio::spawn(async move {
            tokio::time::sleep(self.delay).await;
            self.pending.store(false, Ordering::SeqCst);
            if self.generation() != generation {
                tracing::debug!("reconnect cancelled");
                return;
            }
            reconnect();
        });
    }
}

struct LinkState {
    conn: ConnState,
    writer: Option<mpsc::UnboundedSender<String>>,
    shutdown: Option<watch::Sender<bool>>,
}

struct WsShared {
    url: String,
    subscribe_destination: Option<String>,
    events: EventSender,
    state: Mutex<LinkState>,
    policy: Arc<ReconnectPolicy>,
}

/// Real adapter over a WebSocket. One background task per connection owns
/// both directions; outbound frames arrive through an unbounded channel so
/// `send` never blocks the caller.
#[derive(Clone)]
pub struct WsLink {
    inner: Arc<WsShared>,
}

impl WsLink {
    pub fn new(
        url: String,
        subscribe_destination: Option<String>,
        retry_delay: Duration,
        events: EventSender,
    ) -> Self {
        Self {
            inner: Arc::new(WsShared {
                url,
                subscribe_destination,
                events,
                state: Mutex::new(LinkState {
                    conn: ConnState::Disconnected,
                    writer: None,
                    shutdown: None,
                }),
                policy: ReconnectPolicy::new(retry_delay),
            }),
        }
    }
}

impl Transport for WsLink {
    fn connect(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if matches!(state.conn, ConnState::Connected | ConnState::Connecting) {
                tracing::debug!("connect ignored, link already active");
                return;
            }
            state.conn = ConnState::Connecting;
        }
        let generation = self.inner.policy.generation();
        tokio::spawn(run_connection(self.inner.clone(), generation));
    }

    fn send(&self, frame: &str) -> bool {
        let state = self.inner.state.lock().unwrap();
        if state.conn != ConnState::Connected {
            tracing::warn!("send dropped, link not connected");
            return false;
        }
        match &state.writer {
            Some(writer) => writer.send(frame.to_string()).is_ok(),
            None => false,
        }
    }

    fn disconnect(&self) {
        self.inner.policy.invalidate();
        let shutdown = {
            let mut state = self.inner.state.lock().unwrap();
            state.conn = ConnState::Disconnected;
            state.writer = None;
            state.shutdown.take()
        };
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(true);
        }
        tracing::info!("link disconnected");
    }

    fn is_connected(&self) -> bool {
        self.inner.state.lock().unwrap().conn == ConnState::Connected
    }
}

async fn run_connection(inner: Arc<WsShared>, generation: u64) {
    tracing::info!(url = %inner.url, "connecting");
    let ws = match connect_async(inner.url.as_str()).await {
        Ok((ws, _)) => ws,
        Err(err) => {
            tracing::warn!(error = %err, "connect failed");
            let _ = inner.events.send(TransportEvent::Error(err.to_string()));
            link_down(&inner, generation, false);
            return;
        }
    };
    if inner.policy.generation() != generation {
        // Disconnected while the handshake was in flight.
        return;
    }

    let (mut sink, mut stream) = ws.split();

    // The relay variant must resubscribe before user-visible traffic
    // resumes, on the first open and after every reconnect.
    if let Some(destination) = &inner.subscribe_destination {
        let frame = protocol::subscribe_frame(destination);
        if let Err(err) = sink.send(Message::Text(frame)).await {
            tracing::warn!(error = %err, "subscribe frame failed");
            let _ = inner.events.send(TransportEvent::Error(err.to_string()));
            link_down(&inner, generation, false);
            return;
        }
        tracing::info!(destination = %destination, "subscribed");
    }

    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<String>();
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    {
        let mut state = inner.state.lock().unwrap();
        state.conn = ConnState::Connected;
        state.writer = Some(writer_tx);
        state.shutdown = Some(shutdown_tx);
    }
    tracing::info!("link established");
    let _ = inner.events.send(TransportEvent::Opened);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                let _ = sink.close().await;
                break;
            }
            frame = writer_rx.recv() => match frame {
                Some(frame) => {
                    if let Err(err) = sink.send(Message::Text(frame)).await {
                        tracing::warn!(error = %err, "send failed");
                        break;
                    }
                }
                None => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let _ = inner.events.send(TransportEvent::Message(text));
                }
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!("link closed by peer");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    let _ = inner.events.send(TransportEvent::Error(err.to_string()));
                    break;
                }
            }
        }
    }

    link_down(&inner, generation, true);
}

fn link_down(inner: &Arc<WsShared>, generation: u64, was_open: bool) {
    {
        let mut state = inner.state.lock().unwrap();
        state.conn = ConnState::Disconnected;
        state.writer = None;
        state.shutdown = None;
    }
    if was_open {
        let _ = inner.events.send(TransportEvent::Closed);
    }
    if inner.policy.generation() != generation {
        // Intentional disconnect, no retry.
        return;
    }
    let retry = inner.clone();
    inner.policy.clone().schedule(move || {
        WsLink { inner: retry }.connect();
    });
}

struct MockShared {
    events: EventSender,
    session: SessionWatch,
    response_delay: Duration,
    followup_delay: Duration,
    default_mode: UiMode,
    connected: AtomicBool,
}

impl MockShared {
    fn push_envelope(&self, action: &str, data: Value) {
        let frame = serde_json::json!({ "action": action, "data": data }).to_string();
        // Delivery is unconditional: a pending scripted response outliving a
        // disconnect is applied to whatever state is current at fire time.
        let _ = self.events.send(TransportEvent::Message(frame));
    }

    fn push_action(&self, value: &str) {
        tracing::info!(value = %value, "mock backend responds");
        self.push_envelope("UI_ACTION", Value::String(value.to_string()));
    }
}

/// Scripted stand-in for the device controller. `send` decodes the intent
/// and replays the backend's expected response sequence after fixed delays,
/// so UI code exercised against it behaves identically on a live backend.
#[derive(Clone)]
pub struct MockLink {
    inner: Arc<MockShared>,
}

impl MockLink {
    pub fn new(
        events: EventSender,
        session: SessionWatch,
        response_delay: Duration,
        followup_delay: Duration,
        default_mode: UiMode,
    ) -> Self {
        Self {
            inner: Arc::new(MockShared {
                events,
                session,
                response_delay,
                followup_delay,
                default_mode,
                connected: AtomicBool::new(false),
            }),
        }
    }
}

impl Transport for MockLink {
    fn connect(&self) {
        if self.inner.connected.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("mock link connected");
        let _ = self.inner.events.send(TransportEvent::Opened);
    }

    fn send(&self, frame: &str) -> bool {
        if !self.inner.connected.load(Ordering::SeqCst) {
            tracing::warn!("send dropped, mock link not connected");
            return false;
        }
        let envelope = match Envelope::parse(frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(error = %err, "mock link rejected outbound frame");
                return false;
            }
        };
        tracing::info!(action = %envelope.action, "mock send");
        match envelope.action.as_str() {
            "OPEN" => {
                let is_auth = envelope
                    .data
                    .get("isAuth")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let mock = self.inner.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(mock.response_delay).await;
                    let mode = mock.session.borrow().ui_mode;
                    mock.push_action(match mode {
                        UiMode::TwoStream => "TIPS_OPEN",
                        UiMode::FourStream => "TIPS_OPEN_AUTO",
                    });
                    tokio::time::sleep(mock.followup_delay).await;
                    mock.push_action(if is_auth { "SHOW_QR_SCANNER" } else { "OPEN_DOOR" });
                });
            }
            "CLOSE" => {
                let mock = self.inner.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(mock.response_delay).await;
                    let mode = mock.session.borrow().ui_mode;
                    mock.push_action(match mode {
                        UiMode::TwoStream => "TIPS_CLOSE",
                        UiMode::FourStream => "TIPS_CLOSE_AUTO",
                    });
                    tokio::time::sleep(mock.followup_delay).await;
                    mock.push_action("END");
                });
            }
            "GET_UI_TYPE" => {
                let mock = self.inner.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(mock.response_delay).await;
                    let mode = mock.default_mode;
                    mock.push_envelope("UI_TYPE", Value::from(mode.as_wire()));
                });
            }
            other => {
                tracing::debug!(action = %other, "mock link has no scripted response");
            }
        }
        true
    }

    fn disconnect(&self) {
        if self.inner.connected.swap(false, Ordering::SeqCst) {
            let _ = self.inner.events.send(TransportEvent::Closed);
        }
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode, Intent};
    use crate::session::SessionState;
    use std::sync::atomic::AtomicUsize;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("event channel closed")
    }

    fn action_of(event: TransportEvent) -> String {
        match event {
            TransportEvent::Message(raw) => {
                let value: Value = serde_json::from_str(&raw).unwrap();
                format!("{}:{}", value["action"].as_str().unwrap(), value["data"])
            }
            other => panic!("expected message event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_bursts_schedule_exactly_one_retry() {
        let policy = ReconnectPolicy::new(Duration::from_millis(20));
        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let fired = fired.clone();
            policy.clone().schedule(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn each_fired_timer_allows_the_next_schedule() {
        let policy = ReconnectPolicy::new(Duration::from_millis(10));
        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let count = fired.clone();
            policy.clone().schedule(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidate_cancels_a_pending_retry() {
        let policy = ReconnectPolicy::new(Duration::from_millis(20));
        let fired = Arc::new(AtomicUsize::new(0));
        let count = fired.clone();
        policy.clone().schedule(move || {
            count.fetch_add(1, Ordering::SeqCst);
        });
        policy.invalidate();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn mock_open_as_member_replays_tip_then_scanner() {
        let (_state_tx, state_rx) = watch::channel(SessionState::new(UiMode::TwoStream));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mock = MockLink::new(
            tx,
            state_rx,
            Duration::from_millis(5),
            Duration::from_millis(10),
            UiMode::TwoStream,
        );

        mock.connect();
        assert_eq!(next_event(&mut rx).await, TransportEvent::Opened);

        assert!(mock.send(&encode(Intent::Open { is_auth: true })));
        assert_eq!(
            action_of(next_event(&mut rx).await),
            "UI_ACTION:\"TIPS_OPEN\""
        );
        assert_eq!(
            action_of(next_event(&mut rx).await),
            "UI_ACTION:\"SHOW_QR_SCANNER\""
        );
    }

    #[tokio::test]
    async fn mock_open_as_non_member_ends_at_the_door() {
        let (_state_tx, state_rx) = watch::channel(SessionState::new(UiMode::FourStream));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mock = MockLink::new(
            tx,
            state_rx,
            Duration::from_millis(5),
            Duration::from_millis(10),
            UiMode::FourStream,
        );

        mock.connect();
        let _ = next_event(&mut rx).await;

        assert!(mock.send(&encode(Intent::Open { is_auth: false })));
        assert_eq!(
            action_of(next_event(&mut rx).await),
            "UI_ACTION:\"TIPS_OPEN_AUTO\""
        );
        assert_eq!(
            action_of(next_event(&mut rx).await),
            "UI_ACTION:\"OPEN_DOOR\""
        );
    }

    #[tokio::test]
    async fn mock_close_replays_tip_then_end() {
        let (_state_tx, state_rx) = watch::channel(SessionState::new(UiMode::FourStream));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mock = MockLink::new(
            tx,
            state_rx,
            Duration::from_millis(5),
            Duration::from_millis(10),
            UiMode::FourStream,
        );

        mock.connect();
        let _ = next_event(&mut rx).await;

        assert!(mock.send(&encode(Intent::Close)));
        assert_eq!(
            action_of(next_event(&mut rx).await),
            "UI_ACTION:\"TIPS_CLOSE_AUTO\""
        );
        assert_eq!(action_of(next_event(&mut rx).await), "UI_ACTION:\"END\"");
    }

    #[tokio::test]
    async fn mock_answers_ui_type_requests_with_the_configured_mode() {
        let (_state_tx, state_rx) = watch::channel(SessionState::new(UiMode::FourStream));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mock = MockLink::new(
            tx,
            state_rx,
            Duration::from_millis(5),
            Duration::from_millis(10),
            UiMode::TwoStream,
        );

        mock.connect();
        let _ = next_event(&mut rx).await;

        assert!(mock.send(&encode(Intent::GetUiType)));
        assert_eq!(action_of(next_event(&mut rx).await), "UI_TYPE:1");
    }

    #[tokio::test]
    async fn mock_send_fails_fast_while_disconnected() {
        let (_state_tx, state_rx) = watch::channel(SessionState::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let mock = MockLink::new(
            tx,
            state_rx,
            Duration::from_millis(5),
            Duration::from_millis(10),
            UiMode::FourStream,
        );
        assert!(!mock.send(&encode(Intent::Close)));
    }

    #[tokio::test]
    async fn ws_link_send_fails_fast_while_disconnected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let link = WsLink::new(
            "ws://127.0.0.1:9".to_string(),
            None,
            Duration::from_millis(50),
            tx,
        );
        assert!(!link.send("{}"));
        assert!(!link.is_connected());
    }

    #[tokio::test]
    async fn ws_link_subscribes_on_open_and_again_after_reconnect() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            // First session: check the handshake frame, push one status,
            // then drop the socket to force a reconnect.
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            let first = ws.next().await.unwrap().unwrap();
            let value: Value = serde_json::from_str(first.to_text().unwrap()).unwrap();
            assert_eq!(value["action"], "SUBSCRIBE");
            assert_eq!(value["data"]["destination"], "/topic/ui");
            ws.send(Message::Text(
                r#"{"action":"UI_STATUS","data":"ready"}"#.to_string(),
            ))
            .await
            .unwrap();
            drop(ws);

            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            let again = ws.next().await.unwrap().unwrap();
            let value: Value = serde_json::from_str(again.to_text().unwrap()).unwrap();
            assert_eq!(value["action"], "SUBSCRIBE");
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = WsLink::new(
            format!("ws://{addr}"),
            Some("/topic/ui".to_string()),
            Duration::from_millis(50),
            tx,
        );
        link.connect();

        assert_eq!(next_event(&mut rx).await, TransportEvent::Opened);
        assert_eq!(
            action_of(next_event(&mut rx).await),
            "UI_STATUS:\"ready\""
        );

        // Server dropped the link: expect a close, then a single retry that
        // reconnects and resubscribes.
        loop {
            match next_event(&mut rx).await {
                TransportEvent::Closed => break,
                TransportEvent::Error(_) => continue,
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(next_event(&mut rx).await, TransportEvent::Opened);

        server.await.unwrap();
        link.disconnect();
    }
}
