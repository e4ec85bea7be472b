use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::watch;

/// Layout variant the backend drives the terminal in: four sorting streams
/// on the classic bin, two streams on the electronics-only bin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UiMode {
    #[default]
    FourStream,
    TwoStream,
}

impl UiMode {
    pub fn from_wire(value: u64) -> Option<Self> {
        match value {
            0 => Some(UiMode::FourStream),
            1 => Some(UiMode::TwoStream),
            _ => None,
        }
    }

    pub fn as_wire(self) -> u64 {
        match self {
            UiMode::FourStream => 0,
            UiMode::TwoStream => 1,
        }
    }
}

/// Backend-authenticated user. Only `name` is guaranteed by the protocol;
/// everything else the controller sends along (card id, points balance)
/// is kept verbatim for presentation-layer consumers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub name: String,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Mutable session facts for one running terminal. Exactly one instance
/// lives for the process lifetime; only the dispatcher mutates it, readers
/// get clones through a watch channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionState {
    pub connected: bool,
    pub ui_mode: UiMode,
    pub current_user: Option<UserRecord>,
    pub device_status: String,
    pub last_item_type: Option<String>,
    pub fill_levels: HashMap<String, f64>,
}

impl SessionState {
    pub fn new(ui_mode: UiMode) -> Self {
        Self {
            connected: false,
            ui_mode,
            current_user: None,
            device_status: "idle".to_string(),
            last_item_type: None,
            fill_levels: HashMap::new(),
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new(UiMode::default())
    }
}

/// Read side of the single-writer session store.
pub type SessionWatch = watch::Receiver<SessionState>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ui_mode_maps_wire_values() {
        assert_eq!(UiMode::from_wire(0), Some(UiMode::FourStream));
        assert_eq!(UiMode::from_wire(1), Some(UiMode::TwoStream));
        assert_eq!(UiMode::from_wire(2), None);
        assert_eq!(UiMode::TwoStream.as_wire(), 1);
    }

    #[test]
    fn user_record_retains_unknown_fields() {
        let user: UserRecord =
            serde_json::from_value(serde_json::json!({ "name": "Wei", "points": 120 })).unwrap();
        assert_eq!(user.name, "Wei");
        assert_eq!(user.extra.get("points"), Some(&serde_json::json!(120)));
    }

    #[test]
    fn user_record_requires_name() {
        let result: Result<UserRecord, _> =
            serde_json::from_value(serde_json::json!({ "points": 120 }));
        assert!(result.is_err());
    }

    #[test]
    fn new_session_starts_idle_and_disconnected() {
        let state = SessionState::new(UiMode::TwoStream);
        assert!(!state.connected);
        assert_eq!(state.device_status, "idle");
        assert!(state.current_user.is_none());
        assert!(state.fill_levels.is_empty());
    }
}
