use std::fmt;

/// Lifecycle state of a watcher.
///
/// `NotStarted → Connecting → Watching → (failure) Connecting → … → Stopped`.
/// `Stopped` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatcherState {
    NotStarted,
    Connecting,
    Watching,
    Stopped,
}

impl WatcherState {
    pub fn is_running(self) -> bool {
        matches!(self, WatcherState::Connecting | WatcherState::Watching)
    }
}

impl fmt::Display for WatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WatcherState::NotStarted => "not started",
            WatcherState::Connecting => "connecting",
            WatcherState::Watching => "watching",
            WatcherState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}
