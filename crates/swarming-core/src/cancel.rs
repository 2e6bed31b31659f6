use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

const WAIT_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Deadline,
    Signal,
    Upstream,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Deadline => f.write_str("deadline exceeded"),
            CancelReason::Signal => f.write_str("terminated by signal"),
            CancelReason::Upstream => f.write_str("cancelled upstream"),
        }
    }
}

/// Cloneable cancellation handle. A token is cancelled explicitly, by its
/// deadline, or when its parent is cancelled.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

struct Inner {
    reason: Mutex<Option<CancelReason>>,
    cond: Condvar,
    deadline: Option<Instant>,
    parent: Option<CancelToken>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cause", &self.cause())
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::build(None, None)
    }

    fn build(deadline: Option<Instant>, parent: Option<CancelToken>) -> Self {
        Self {
            inner: Arc::new(Inner {
                reason: Mutex::new(None),
                cond: Condvar::new(),
                deadline,
                parent,
            }),
        }
    }

    pub fn child(&self) -> CancelToken {
        Self::build(None, Some(self.clone()))
    }

    pub fn with_deadline(&self, deadline: Instant) -> CancelToken {
        Self::build(Some(deadline), Some(self.clone()))
    }

    pub fn with_timeout(&self, timeout: Duration) -> CancelToken {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        let own = self.inner.deadline;
        let parent = self.inner.parent.as_ref().and_then(|p| p.deadline());
        match (own, parent) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Cancels this token and its descendants. The first reason wins.
    pub fn cancel(&self, reason: CancelReason) {
        let mut guard = self.inner.reason.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(reason);
        }
        self.inner.cond.notify_all();
    }

    pub fn cause(&self) -> Option<CancelReason> {
        let own = *self.inner.reason.lock().unwrap_or_else(|e| e.into_inner());
        if own.is_some() {
            return own;
        }
        if let Some(parent) = self.inner.parent.as_ref() {
            if let Some(reason) = parent.cause() {
                return Some(reason);
            }
        }
        match self.inner.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(CancelReason::Deadline),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cause().is_some()
    }

    /// Blocks up to `timeout`; returns true as soon as the token is cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let until = Instant::now() + timeout;
        loop {
            if self.is_cancelled() {
                return true;
            }
            let now = Instant::now();
            if now >= until {
                return false;
            }
            let mut slice = (until - now).min(WAIT_SLICE);
            if let Some(deadline) = self.inner.deadline {
                slice = slice.min(deadline.saturating_duration_since(now));
            }
            let guard = self.inner.reason.lock().unwrap_or_else(|e| e.into_inner());
            if guard.is_some() {
                return true;
            }
            let _ = self
                .inner
                .cond
                .wait_timeout(guard, slice)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn first_reason_wins() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel(CancelReason::Signal);
        token.cancel(CancelReason::Upstream);
        assert_eq!(token.cause(), Some(CancelReason::Signal));
    }

    #[test]
    fn child_observes_parent_but_not_the_reverse() {
        let parent = CancelToken::new();
        let child = parent.child();
        child.cancel(CancelReason::Upstream);
        assert!(!parent.is_cancelled());

        let other = parent.child();
        parent.cancel(CancelReason::Signal);
        assert_eq!(other.cause(), Some(CancelReason::Signal));
    }

    #[test]
    fn deadline_cancels_with_deadline_reason() {
        let token = CancelToken::new().with_timeout(Duration::from_millis(20));
        assert!(!token.is_cancelled());
        assert!(token.wait_timeout(Duration::from_secs(5)));
        assert_eq!(token.cause(), Some(CancelReason::Deadline));
    }

    #[test]
    fn wait_timeout_wakes_on_cancel_from_another_thread() {
        let token = CancelToken::new();
        let remote = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            remote.cancel(CancelReason::Upstream);
        });
        let started = Instant::now();
        assert!(token.wait_timeout(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.join().expect("join");
    }

    #[test]
    fn wait_timeout_returns_false_when_not_cancelled() {
        let token = CancelToken::new();
        assert!(!token.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn effective_deadline_is_the_earliest() {
        let now = Instant::now();
        let outer = CancelToken::new().with_deadline(now + Duration::from_secs(10));
        let inner = outer.with_deadline(now + Duration::from_secs(60));
        assert_eq!(inner.deadline(), Some(now + Duration::from_secs(10)));
    }
}
