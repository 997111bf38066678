use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one recording.
///
/// ```text
/// Idle -> Starting -> Recording -> Stopping -> Merging -> Done
///   \________\___________\___________\___________\-----> Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Starting,
    Recording,
    Stopping,
    Merging,
    Done,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Done | SessionState::Aborted)
    }

    /// A new recording may begin from here.
    pub fn can_start(self) -> bool {
        matches!(
            self,
            SessionState::Idle | SessionState::Done | SessionState::Aborted
        )
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Idle | Done | Aborted, Starting) => true,
            (Starting, Recording) => true,
            (Recording, Stopping) => true,
            (Stopping, Merging) => true,
            (Merging, Done) => true,
            (Idle | Starting | Recording | Stopping | Merging, Aborted) => true,
            _ => false,
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState::Idle
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Recording => "recording",
            SessionState::Stopping => "stopping",
            SessionState::Merging => "merging",
            SessionState::Done => "done",
            SessionState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}
