use crate::session::{UiMode, UserRecord};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

/// Screen-transition commands carried in `UI_ACTION` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiAction {
    Index,
    ShowQrScanner,
    OpenDoor,
    End,
    EndNoPoints,
    TipsOpen,
    TipsOpenAuto,
    TipsClose,
    TipsCloseAuto,
}

impl UiAction {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "INDEX" => Some(UiAction::Index),
            "SHOW_QR_SCANNER" => Some(UiAction::ShowQrScanner),
            "OPEN_DOOR" => Some(UiAction::OpenDoor),
            "END" => Some(UiAction::End),
            "END_NO_POINTS" => Some(UiAction::EndNoPoints),
            "TIPS_OPEN" => Some(UiAction::TipsOpen),
            "TIPS_OPEN_AUTO" => Some(UiAction::TipsOpenAuto),
            "TIPS_CLOSE" => Some(UiAction::TipsClose),
            "TIPS_CLOSE_AUTO" => Some(UiAction::TipsCloseAuto),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UiAction::Index => "INDEX",
            UiAction::ShowQrScanner => "SHOW_QR_SCANNER",
            UiAction::OpenDoor => "OPEN_DOOR",
            UiAction::End => "END",
            UiAction::EndNoPoints => "END_NO_POINTS",
            UiAction::TipsOpen => "TIPS_OPEN",
            UiAction::TipsOpenAuto => "TIPS_OPEN_AUTO",
            UiAction::TipsClose => "TIPS_CLOSE",
            UiAction::TipsCloseAuto => "TIPS_CLOSE_AUTO",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ItemUpdate {
    pub item_type: String,
    pub raw: Value,
}

/// One variant per recognized backend action, produced by the validating
/// decode so the dispatcher matches exhaustively instead of probing fields.
#[derive(Debug, Clone)]
pub enum Inbound {
    Error(String),
    Action(UiAction),
    Status(String),
    Mode(UiMode),
    UserInfo(UserRecord),
    ItemUpdate(ItemUpdate),
    Voice(String),
    Rate(Value),
    Proportion(HashMap<String, f64>),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("invalid payload for {action}: {reason}")]
    InvalidPayload {
        action: &'static str,
        reason: String,
    },
}

/// Raw `{action, data}` wire envelope, parsed but not yet validated.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub action: String,
    pub data: Value,
}

impl Envelope {
    pub fn parse(raw: &str) -> Result<Self, DecodeError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|err| DecodeError::Malformed(err.to_string()))?;
        let action = value
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| DecodeError::Malformed("missing action field".to_string()))?
            .to_string();
        let data = value.get("data").cloned().unwrap_or(Value::Null);
        Ok(Envelope { action, data })
    }
}

fn invalid(action: &'static str, reason: impl Into<String>) -> DecodeError {
    DecodeError::InvalidPayload {
        action,
        reason: reason.into(),
    }
}

fn expect_str(action: &'static str, data: &Value) -> Result<String, DecodeError> {
    data.as_str()
        .map(str::to_string)
        .ok_or_else(|| invalid(action, "expected string data"))
}

/// Validate a parsed envelope into the typed inbound set. Fails closed:
/// unrecognized actions and wrong-shaped payloads are rejected, never
/// partially applied.
pub fn classify(envelope: &Envelope) -> Result<Inbound, DecodeError> {
    match envelope.action.as_str() {
        "UI_ERROR" => Ok(Inbound::Error(expect_str("UI_ERROR", &envelope.data)?)),
        "UI_ACTION" => {
            let value = expect_str("UI_ACTION", &envelope.data)?;
            let action = UiAction::parse(&value)
                .ok_or_else(|| invalid("UI_ACTION", format!("unrecognized value {value}")))?;
            Ok(Inbound::Action(action))
        }
        "UI_STATUS" => Ok(Inbound::Status(expect_str("UI_STATUS", &envelope.data)?)),
        "UI_TYPE" => {
            let mode = envelope
                .data
                .as_u64()
                .and_then(UiMode::from_wire)
                .ok_or_else(|| invalid("UI_TYPE", "expected 0 or 1"))?;
            Ok(Inbound::Mode(mode))
        }
        "UI_USER_INFO" => {
            let user: UserRecord = serde_json::from_value(envelope.data.clone())
                .map_err(|err| invalid("UI_USER_INFO", err.to_string()))?;
            Ok(Inbound::UserInfo(user))
        }
        "UI_UPDATE" => {
            let item_type = envelope
                .data
                .get("type")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid("UI_UPDATE", "missing type field"))?
                .to_string();
            Ok(Inbound::ItemUpdate(ItemUpdate {
                item_type,
                raw: envelope.data.clone(),
            }))
        }
        "UI_VOICE" => Ok(Inbound::Voice(expect_str("UI_VOICE", &envelope.data)?)),
        "UI_RATE" => {
            if !envelope.data.is_object() {
                return Err(invalid("UI_RATE", "expected object data"));
            }
            Ok(Inbound::Rate(envelope.data.clone()))
        }
        "UI_PROPORTION" => {
            let map = envelope
                .data
                .as_object()
                .ok_or_else(|| invalid("UI_PROPORTION", "expected object data"))?;
            let mut levels = HashMap::with_capacity(map.len());
            for (category, value) in map {
                let fraction = value
                    .as_f64()
                    .filter(|f| (0.0..=1.0).contains(f))
                    .ok_or_else(|| {
                        invalid(
                            "UI_PROPORTION",
                            format!("{category} is not a fraction in [0,1]"),
                        )
                    })?;
                levels.insert(category.clone(), fraction);
            }
            Ok(Inbound::Proportion(levels))
        }
        other => Err(DecodeError::UnknownAction(other.to_string())),
    }
}

pub fn decode(raw: &str) -> Result<Inbound, DecodeError> {
    classify(&Envelope::parse(raw)?)
}

/// Business commands the terminal sends to the device controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Open { is_auth: bool },
    Close,
    ConfirmStart,
    DoorOpened,
    Confirm,
    GetUiType,
}

impl Intent {
    pub fn action(self) -> &'static str {
        match self {
            Intent::Open { .. } => "OPEN",
            Intent::Close => "CLOSE",
            Intent::ConfirmStart => "CONFIRM_START",
            Intent::DoorOpened => "DOOR_OPENED",
            Intent::Confirm => "CONFIRM",
            Intent::GetUiType => "GET_UI_TYPE",
        }
    }

    fn data(self) -> Value {
        match self {
            Intent::Open { is_auth } => serde_json::json!({ "isAuth": is_auth }),
            _ => serde_json::json!({}),
        }
    }
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn encode(intent: Intent) -> String {
    serde_json::json!({
        "action": intent.action(),
        "data": intent.data(),
        "timestamp": now_unix_ms(),
    })
    .to_string()
}

/// Handshake frame for the relay protocol variant, replayed by the transport
/// on every (re)open before user-visible traffic resumes.
pub fn subscribe_frame(destination: &str) -> String {
    serde_json::json!({
        "action": "SUBSCRIBE",
        "data": {
            "destination": destination,
            "id": Uuid::new_v4().to_string(),
        },
        "timestamp": now_unix_ms(),
    })
    .to_string()
}
