use crate::bus::{Notification, NotificationBus, Topic};
use crate::nav::{NavMode, Navigator, Screen};
use crate::protocol::{self, Envelope, Inbound, Intent, UiAction};
use crate::session::{SessionState, UiMode};
use crate::transport::{Transport, TransportEvent};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Outbound business surface, callable from anywhere in the synchronous
/// call stack (UI button handlers included). Sends fail fast while the link
/// is down instead of queueing.
#[derive(Clone)]
pub struct Commands {
    transport: Arc<dyn Transport>,
}

impl Commands {
    pub fn open_as_member(&self) -> bool {
        self.send(Intent::Open { is_auth: true })
    }

    pub fn open_as_non_member(&self) -> bool {
        self.send(Intent::Open { is_auth: false })
    }

    pub fn close(&self) -> bool {
        self.send(Intent::Close)
    }

    pub fn confirm_start(&self) -> bool {
        self.send(Intent::ConfirmStart)
    }

    pub fn door_opened(&self) -> bool {
        self.send(Intent::DoorOpened)
    }

    pub fn confirm(&self) -> bool {
        self.send(Intent::Confirm)
    }

    pub fn request_ui_mode(&self) -> bool {
        self.send(Intent::GetUiType)
    }

    fn send(&self, intent: Intent) -> bool {
        let sent = self.transport.send(&protocol::encode(intent));
        if sent {
            tracing::info!(action = intent.action(), "intent sent");
        } else {
            tracing::warn!(action = intent.action(), "intent dropped, link not connected");
        }
        sent
    }
}

/// The state machine. Owns the session state (single writer), consumes
/// transport events strictly in receipt order, and turns each validated
/// message into a state mutation, a navigation decision, a notification, or
/// some combination. Never panics on input.
pub struct Dispatcher {
    state: SessionState,
    transport: Arc<dyn Transport>,
    navigator: Arc<dyn Navigator>,
    bus: Arc<NotificationBus>,
    snapshot: watch::Sender<SessionState>,
}

impl Dispatcher {
    pub fn new(
        initial: SessionState,
        transport: Arc<dyn Transport>,
        navigator: Arc<dyn Navigator>,
        bus: Arc<NotificationBus>,
        snapshot: watch::Sender<SessionState>,
    ) -> Self {
        Self {
            state: initial,
            transport,
            navigator,
            bus,
            snapshot,
        }
    }

    pub fn commands(&self) -> Commands {
        Commands {
            transport: self.transport.clone(),
        }
    }

    /// Consume transport events until the channel closes. One event is
    /// handled to completion before the next is considered.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
    }

    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => {
                self.state.connected = true;
                self.publish();
                self.bus.emit(Topic::Connection, Notification::Connection(true));
                // A restarted terminal converges on the backend's mode.
                if !self.transport.send(&protocol::encode(Intent::GetUiType)) {
                    tracing::warn!("ui mode request dropped at open");
                }
            }
            TransportEvent::Closed => {
                self.state.connected = false;
                self.publish();
                self.bus
                    .emit(Topic::Connection, Notification::Connection(false));
            }
            TransportEvent::Error(info) => {
                tracing::warn!(info = %info, "transport error");
                self.bus
                    .emit(Topic::Connection, Notification::Connection(false));
            }
            TransportEvent::Message(raw) => self.handle_message(&raw),
        }
    }

    fn handle_message(&mut self, raw: &str) {
        let envelope = match Envelope::parse(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(error = %err, "dropping malformed message");
                return;
            }
        };
        self.bus.emit(
            Topic::Message,
            Notification::Message {
                action: envelope.action.clone(),
                data: envelope.data.clone(),
            },
        );
        match protocol::classify(&envelope) {
            Ok(inbound) => self.apply(inbound),
            Err(err) => {
                tracing::warn!(action = %envelope.action, error = %err, "dropping message");
            }
        }
    }

    fn apply(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Error(message) => {
                tracing::error!(message = %message, "backend reported error");
                self.bus.emit(Topic::Error, Notification::Error(message));
                self.navigator.go_to(Screen::Error, NavMode::Replace);
            }
            Inbound::Action(action) => self.apply_action(action),
            Inbound::Status(status) => {
                tracing::info!(status = %status, "device status");
                self.state.device_status = status;
                self.publish();
            }
            Inbound::Mode(mode) => {
                // Mode lands in state before the home screen is derived
                // from it.
                self.state.ui_mode = mode;
                self.publish();
                self.navigator
                    .go_to(Screen::home_for(mode), NavMode::Replace);
            }
            Inbound::UserInfo(user) => {
                tracing::info!(name = %user.name, "user signed in");
                self.state.current_user = Some(user);
                self.publish();
            }
            Inbound::ItemUpdate(item) => {
                tracing::info!(item = %item.item_type, "item recognized");
                self.state.last_item_type = Some(item.item_type);
                self.publish();
                self.bus
                    .emit(Topic::ItemUpdate, Notification::ItemUpdate(item.raw));
            }
            Inbound::Voice(text) => {
                self.bus.emit(Topic::Voice, Notification::Voice(text));
            }
            Inbound::Rate(config) => {
                self.bus.emit(Topic::RateConfig, Notification::RateConfig(config));
            }
            Inbound::Proportion(levels) => {
                self.state.fill_levels.extend(levels.clone());
                self.publish();
                self.bus
                    .emit(Topic::Proportion, Notification::Proportion(levels));
            }
        }
    }

    fn apply_action(&mut self, action: UiAction) {
        match action {
            UiAction::Index => {
                self.navigator
                    .go_to(Screen::home_for(self.state.ui_mode), NavMode::Replace);
            }
            UiAction::ShowQrScanner => self.navigator.go_to(Screen::Scan, NavMode::Push),
            UiAction::OpenDoor => {
                let screen = match self.state.ui_mode {
                    UiMode::TwoStream => Screen::DepositElectronics,
                    UiMode::FourStream => Screen::DepositGeneral,
                };
                self.navigator.go_to(screen, NavMode::Push);
            }
            UiAction::End => {
                // The thank-you variant depends on who was signed in when
                // the session closed, decided before the fields reset.
                let screen = if self.state.current_user.is_some() {
                    Screen::ThankYou
                } else {
                    Screen::ThankYouNoPoints
                };
                self.end_session();
                self.navigator.go_to(screen, NavMode::Push);
            }
            UiAction::EndNoPoints => {
                self.end_session();
                self.navigator.go_to(Screen::ThankYouNoPoints, NavMode::Push);
            }
            UiAction::TipsOpen => self.navigator.go_to(Screen::TipOpenManual, NavMode::Push),
            UiAction::TipsOpenAuto => self.navigator.go_to(Screen::TipOpenAuto, NavMode::Push),
            UiAction::TipsClose => self.navigator.go_to(Screen::TipCloseManual, NavMode::Push),
            UiAction::TipsCloseAuto => self.navigator.go_to(Screen::TipCloseAuto, NavMode::Push),
        }
    }

    fn end_session(&mut self) {
        self.state.current_user = None;
        self.state.last_item_type = None;
        self.publish();
    }

    fn publish(&self) {
        let _ = self.snapshot.send(self.state.clone());
    }
}
