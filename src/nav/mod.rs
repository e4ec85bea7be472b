use crate::session::UiMode;
use std::sync::Mutex;

/// The fixed screen set the backend can steer the terminal through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Screen {
    HomeFourStream,
    HomeTwoStream,
    Scan,
    DepositGeneral,
    DepositElectronics,
    TipOpenManual,
    TipOpenAuto,
    TipCloseManual,
    TipCloseAuto,
    ThankYou,
    ThankYouNoPoints,
    Error,
    Offline,
}

impl Screen {
    pub fn home_for(mode: UiMode) -> Screen {
        match mode {
            UiMode::FourStream => Screen::HomeFourStream,
            UiMode::TwoStream => Screen::HomeTwoStream,
        }
    }

    /// Route path the presentation layer mounts the screen under.
    pub fn route(self) -> &'static str {
        match self {
            Screen::HomeFourStream => "/",
            Screen::HomeTwoStream => "/recycle",
            Screen::Scan => "/scan",
            Screen::DepositGeneral => "/nonmember",
            Screen::DepositElectronics => "/nonmember-elec",
            Screen::TipOpenManual => "/tip-open",
            Screen::TipOpenAuto => "/tip-open-auto",
            Screen::TipCloseManual => "/tip-close",
            Screen::TipCloseAuto => "/tip-close-auto",
            Screen::ThankYou => "/thankyou",
            Screen::ThankYouNoPoints => "/thankyou-no-points",
            Screen::Error => "/error",
            Screen::Offline => "/offline",
        }
    }
}

/// `Replace` swaps the current entry so the back stack cannot return to a
/// stale screen; `Push` grows history for forward flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavMode {
    Push,
    Replace,
}

/// Seam between the dispatcher and whatever renders screens.
pub trait Navigator: Send + Sync {
    fn go_to(&self, screen: Screen, mode: NavMode);
}

#[derive(Default)]
struct RouterState {
    stack: Vec<Screen>,
}

/// Default navigator: keeps the history stack and enforces idempotent
/// transitions (re-requesting the active screen is a no-op, not an error).
#[derive(Default)]
pub struct ScreenRouter {
    state: Mutex<RouterState>,
}

impl ScreenRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Screen> {
        self.state.lock().unwrap().stack.last().copied()
    }

    pub fn depth(&self) -> usize {
        self.state.lock().unwrap().stack.len()
    }
}

impl Navigator for ScreenRouter {
    fn go_to(&self, screen: Screen, mode: NavMode) {
        let mut state = self.state.lock().unwrap();
        if state.stack.last() == Some(&screen) {
            tracing::debug!(route = screen.route(), "already on screen");
            return;
        }
        match mode {
            NavMode::Replace => {
                state.stack.pop();
                state.stack.push(screen);
            }
            NavMode::Push => state.stack.push(screen),
        }
        tracing::info!(route = screen.route(), mode = ?mode, "navigate");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_grows_history_and_replace_does_not() {
        let router = ScreenRouter::new();
        router.go_to(Screen::HomeFourStream, NavMode::Replace);
        assert_eq!(router.depth(), 1);

        router.go_to(Screen::Scan, NavMode::Push);
        assert_eq!(router.depth(), 2);
        assert_eq!(router.current(), Some(Screen::Scan));

        router.go_to(Screen::Error, NavMode::Replace);
        assert_eq!(router.depth(), 2);
        assert_eq!(router.current(), Some(Screen::Error));
    }

    #[test]
    fn repeat_of_active_screen_is_a_noop() {
        let router = ScreenRouter::new();
        router.go_to(Screen::Scan, NavMode::Push);
        router.go_to(Screen::Scan, NavMode::Push);
        router.go_to(Screen::Scan, NavMode::Replace);
        assert_eq!(router.depth(), 1);
        assert_eq!(router.current(), Some(Screen::Scan));
    }

    #[test]
    fn home_screen_follows_ui_mode() {
        assert_eq!(Screen::home_for(UiMode::FourStream), Screen::HomeFourStream);
        assert_eq!(Screen::home_for(UiMode::TwoStream), Screen::HomeTwoStream);
    }
}
