use std::time::Duration;
use tokio::time::Instant;

/// Tracks client liveness for one session
///
/// Any inbound frame counts as a keepalive. When the window passes without
/// one the session is stopped as if the client had sent `stop`.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    window: Duration,
    last_seen: Instant,
}

impl HeartbeatMonitor {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_seen: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn deadline(&self) -> Instant {
        self.last_seen + self.window
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}
