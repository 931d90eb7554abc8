use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SchedulerState {
    #[default]
    Stopped,
    /// Loading requested before a track was chosen.
    Starting,
    Idle,
    Paused,
    KeyLoading,
    FragLoading,
    FragLoadingWaitingRetry,
    /// Track details are missing.
    WaitingTrack,
    /// Audio waits for the main timeline's init PTS of the fragment's continuity.
    WaitingInitPts,
    Parsing,
    Parsed,
    /// The track is exhausted.
    Ended,
    /// Halted by a fatal error until reset.
    Error,
}

impl SchedulerState {
    pub fn as_str(self) -> &'static str {
        match self {
            SchedulerState::Stopped => "STOPPED",
            SchedulerState::Starting => "STARTING",
            SchedulerState::Idle => "IDLE",
            SchedulerState::Paused => "PAUSED",
            SchedulerState::KeyLoading => "KEY_LOADING",
            SchedulerState::FragLoading => "FRAG_LOADING",
            SchedulerState::FragLoadingWaitingRetry => "FRAG_LOADING_WAITING_RETRY",
            SchedulerState::WaitingTrack => "WAITING_TRACK",
            SchedulerState::WaitingInitPts => "WAITING_INIT_PTS",
            SchedulerState::Parsing => "PARSING",
            SchedulerState::Parsed => "PARSED",
            SchedulerState::Ended => "ENDED",
            SchedulerState::Error => "ERROR",
        }
    }

    /// A fragment or key request is outstanding or its payload is being processed.
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            SchedulerState::KeyLoading
                | SchedulerState::FragLoading
                | SchedulerState::Parsing
                | SchedulerState::Parsed
        )
    }
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
