use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Set-once shutdown flag plus the broadcast observed by every delivery loop.
///
/// The flag is the single source of truth for whether new work may start; it
/// is only read and written under its guard.
#[derive(Debug, Default)]
pub(crate) struct ShutdownSignal {
    closed: Mutex<bool>,
    token: CancellationToken,
}

impl ShutdownSignal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.lock()
    }

    /// Flips the flag and fires the broadcast. Returns `false` if shutdown had
    /// already been triggered, in which case nothing happens.
    pub(crate) fn trigger(&self) -> bool {
        let mut closed = self.closed.lock();
        if *closed {
            return false;
        }

        *closed = true;
        self.token.cancel();

        true
    }

    /// Runs `start` while holding the guard, unless shutdown was triggered.
    pub(crate) fn unless_closed<R>(&self, start: impl FnOnce() -> R) -> Option<R> {
        let closed = self.closed.lock();
        if *closed {
            return None;
        }

        Some(start())
    }

    pub(crate) const fn token(&self) -> &CancellationToken {
        &self.token
    }
}
