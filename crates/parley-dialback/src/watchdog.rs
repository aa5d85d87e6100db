//! Authentication deadline for new connections.

use crate::ports::TimerService;
use crate::session::S2SSession;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Default time a connection may stay unauthenticated.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(30);

/// Force-closes connections that fail to authenticate in time.
#[derive(Debug, Clone, Copy)]
pub struct AuthenticationWatchdog {
    timeout: Duration,
}

impl AuthenticationWatchdog {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Schedules the check for `session`.
    ///
    /// The timer holds only a weak reference; a session already dropped by
    /// the manager is left alone.
    pub fn arm(&self, timer: &dyn TimerService, session: &Arc<S2SSession>) {
        let weak: Weak<S2SSession> = Arc::downgrade(session);
        let timeout = self.timeout;
        timer.schedule(
            timeout,
            Box::new(move || {
                if let Some(session) = weak.upgrade() {
                    expire(&session, timeout);
                }
            }),
        );
    }
}

impl Default for AuthenticationWatchdog {
    fn default() -> Self {
        Self::new(DEFAULT_AUTH_TIMEOUT)
    }
}

fn expire(session: &S2SSession, timeout: Duration) {
    if session.is_authenticated() || !session.is_open() {
        return;
    }
    tracing::info!(
        conn = %session.id(),
        ip = session.link().ip(),
        timeout_secs = timeout.as_secs(),
        "connection not authenticated in time, closing"
    );
    session.force_stop();
}
