use std::io;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use swarming_core::{CancelReason, CancelToken};

const ABORT_PAYLOAD: &[u8] = b"abort";
const STOP_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AbortOutcome {
    pub reason: Option<CancelReason>,
    pub delivered: bool,
}

impl AbortOutcome {
    pub fn requested(&self) -> bool {
        self.reason.is_some()
    }
}

/// Sends one datagram to the engine's abort socket.
pub fn send_abort(sock: &Path) -> io::Result<()> {
    let socket = UnixDatagram::unbound()?;
    socket.send_to(ABORT_PAYLOAD, sock)?;
    Ok(())
}

/// Watches a cancel token for the lifetime of one engine run and forwards
/// the first cancellation to the abort socket.
pub struct AbortWatcher {
    stop: CancelToken,
    handle: Option<JoinHandle<AbortOutcome>>,
}

impl AbortWatcher {
    pub fn spawn(sock: PathBuf, cancel: CancelToken) -> Self {
        let stop = CancelToken::new();
        let stop_seen = stop.clone();
        let handle = thread::spawn(move || {
            loop {
                if !cancel.wait_timeout(STOP_POLL) {
                    if stop_seen.is_cancelled() {
                        return AbortOutcome::default();
                    }
                    continue;
                }
                let reason = cancel.cause();
                tracing::info!(sock = %sock.display(), reason = ?reason, "forwarding abort to engine");
                let delivered = match send_abort(&sock) {
                    Ok(()) => true,
                    Err(err) => {
                        tracing::warn!(sock = %sock.display(), error = %err, "failed to deliver abort datagram");
                        false
                    }
                };
                return AbortOutcome { reason, delivered };
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Stops watching and reports whether an abort was forwarded.
    pub fn stop(mut self) -> AbortOutcome {
        self.finish()
    }

    fn finish(&mut self) -> AbortOutcome {
        self.stop.cancel(CancelReason::Upstream);
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_default(),
            None => AbortOutcome::default(),
        }
    }
}

impl Drop for AbortWatcher {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::fs;

    struct TempDirGuard {
        path: PathBuf,
    }

    impl TempDirGuard {
        fn new(prefix: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "{}_{}_{}",
                prefix,
                std::process::id(),
                Utc::now().timestamp_micros()
            ));
            fs::create_dir_all(&path).expect("temp dir");
            Self { path }
        }
    }

    impl Drop for TempDirGuard {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    #[test]
    fn cancellation_sends_exactly_one_datagram() {
        let root = TempDirGuard::new("ssw_abort_send");
        let sock = root.path.join("abort_sock");
        let listener = UnixDatagram::bind(&sock).expect("bind");
        listener
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("timeout");

        let cancel = CancelToken::new();
        let watcher = AbortWatcher::spawn(sock.clone(), cancel.clone());
        cancel.cancel(CancelReason::Deadline);
        let mut buf = [0u8; 32];
        let n = listener.recv(&mut buf).expect("abort datagram");
        assert_eq!(&buf[..n], ABORT_PAYLOAD);

        let outcome = watcher.stop();
        assert_eq!(outcome.reason, Some(CancelReason::Deadline));
        assert!(outcome.delivered);

        listener.set_nonblocking(true).expect("nonblocking");
        assert!(listener.recv(&mut buf).is_err(), "second datagram sent");
    }

    #[test]
    fn stopping_without_cancellation_sends_nothing() {
        let root = TempDirGuard::new("ssw_abort_quiet");
        let sock = root.path.join("abort_sock");
        let listener = UnixDatagram::bind(&sock).expect("bind");
        let cancel = CancelToken::new();
        let outcome = AbortWatcher::spawn(sock, cancel.clone()).stop();
        assert!(!outcome.requested());
        cancel.cancel(CancelReason::Signal);
        listener.set_nonblocking(true).expect("nonblocking");
        let mut buf = [0u8; 8];
        assert!(listener.recv(&mut buf).is_err());
    }

    #[test]
    fn missing_socket_is_reported_not_raised() {
        let root = TempDirGuard::new("ssw_abort_missing");
        let cancel = CancelToken::new();
        cancel.cancel(CancelReason::Signal);
        let outcome = AbortWatcher::spawn(root.path.join("abort_sock"), cancel).stop();
        assert!(outcome.requested());
        assert!(!outcome.delivered);
    }
}
