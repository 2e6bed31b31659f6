//! Invocation of the lucifer engine for one DUT.
//!
//! The child's stderr is piped through a parser thread that forwards every
//! line verbatim to our stderr (and the annotation sink, if any) while
//! folding the event stream. An abort watcher runs alongside for the
//! lifetime of the child. Both are joined before `run` returns.

use crate::abort::{AbortOutcome, AbortWatcher};
use crate::annotations::AnnotationSink;
use crate::errors::TaskError;
use crate::events::EventSummary;
use anyhow::{anyhow, Context, Result};
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ChildStderr, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use swarming_core::CancelToken;

pub const GCP_PROJECT: &str = "chromeos-skylab";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineTask {
    /// `admintask -task <name>`: repair, reset, cleanup and friends.
    Admin { task: String },
    Deploy { actions: Vec<String> },
    Audit { actions: Vec<String> },
}

impl EngineTask {
    fn subcommand(&self) -> &'static str {
        match self {
            EngineTask::Admin { .. } => "admintask",
            EngineTask::Deploy { .. } => "deploytask",
            EngineTask::Audit { .. } => "audittask",
        }
    }

    pub fn describe(&self) -> String {
        match self {
            EngineTask::Admin { task } => format!("admin task {}", task),
            EngineTask::Deploy { .. } => "deploy task".to_string(),
            EngineTask::Audit { .. } => "audit task".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineArgs {
    pub task: EngineTask,
    pub hostname: String,
    pub results_dir: PathBuf,
    pub abort_sock: PathBuf,
    pub logdog_file: Option<PathBuf>,
}

/// What one engine run left behind.
#[derive(Debug, Clone, Default)]
pub struct EngineRun {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub events: EventSummary,
    pub abort: AbortOutcome,
    /// Set when the engine failed without reporting any test failure.
    pub autoserv_synthesized: bool,
}

impl EngineRun {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn autoserv_failed(&self) -> bool {
        self.events.autoserv_failed || self.autoserv_synthesized
    }

    pub fn status(&self) -> String {
        match (self.exit_code, self.signal) {
            (Some(code), _) => format!("exit code {}", code),
            (None, Some(sig)) => format!("signal {}", sig),
            (None, None) => "unknown status".to_string(),
        }
    }

    /// Cancellation takes precedence over the exit status.
    pub fn check(&self) -> Result<()> {
        if let Some(reason) = self.abort.reason {
            return Err(anyhow::Error::new(TaskError::Cancelled { reason }))
                .with_context(|| format!("lucifer aborted with {}", self.status()));
        }
        if !self.succeeded() {
            return Err(anyhow!("lucifer failed with {}", self.status()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Engine {
    lucifer: PathBuf,
    autotest_dir: PathBuf,
}

impl Engine {
    pub fn new(lucifer: &Path, autotest_dir: &Path) -> Self {
        Self {
            lucifer: lucifer.to_path_buf(),
            autotest_dir: autotest_dir.to_path_buf(),
        }
    }

    pub fn args(&self, args: &EngineArgs) -> Vec<String> {
        let mut out = vec![
            args.task.subcommand().to_string(),
            "-autotestdir".to_string(),
            self.autotest_dir.display().to_string(),
            "-abortsock".to_string(),
            args.abort_sock.display().to_string(),
            "-gcp-project".to_string(),
            GCP_PROJECT.to_string(),
            "-hostname".to_string(),
            args.hostname.clone(),
            "-resultsdir".to_string(),
            args.results_dir.display().to_string(),
        ];
        if let Some(fifo) = &args.logdog_file {
            out.push("-logdog-file".to_string());
            out.push(fifo.display().to_string());
        }
        match &args.task {
            EngineTask::Admin { task } => {
                out.push("-task".to_string());
                out.push(task.clone());
            }
            EngineTask::Deploy { actions } | EngineTask::Audit { actions } => {
                if !actions.is_empty() {
                    out.push("-actions".to_string());
                    out.push(actions.join(","));
                }
            }
        }
        out
    }

    pub fn command(&self, args: &EngineArgs) -> Command {
        let mut cmd = Command::new(&self.lucifer);
        cmd.args(self.args(args));
        cmd
    }

    /// Runs the engine to completion. Cancellation is forwarded through the
    /// abort socket and the child is left to exit on its own.
    pub fn run(
        &self,
        args: &EngineArgs,
        cancel: &CancelToken,
        tee: Option<&AnnotationSink>,
    ) -> Result<EngineRun> {
        if let Some(reason) = cancel.cause() {
            return Err(anyhow::Error::new(TaskError::Cancelled { reason }))
                .with_context(|| format!("{} for {} not started", args.task.describe(), args.hostname));
        }

        let mut cmd = self.command(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::piped());

        tracing::info!(
            hostname = %args.hostname,
            task = %args.task.describe(),
            results_dir = %args.results_dir.display(),
            deadline_in = ?cancel.deadline().map(|d| d.saturating_duration_since(Instant::now())),
            "launching lucifer"
        );
        let mut child = cmd
            .spawn()
            .with_context(|| format!("launch {}", self.lucifer.display()))?;

        let parser = match child.stderr.take() {
            Some(stderr) => {
                let tee = tee.cloned();
                Some(thread::spawn(move || forward_events(stderr, tee)))
            }
            None => None,
        };
        let watcher = AbortWatcher::spawn(args.abort_sock.clone(), cancel.clone());

        let waited = child.wait();
        let abort = watcher.stop();
        let events = join_parser(parser, &args.hostname);
        let status = waited.context("wait for lucifer")?;
        let events = events?;

        let mut run = EngineRun {
            exit_code: status.code(),
            signal: status.signal(),
            events,
            abort,
            autoserv_synthesized: false,
        };
        if !run.succeeded() && !run.abort.requested() && !run.events.saw_test_failure() {
            run.autoserv_synthesized = true;
        }
        tracing::info!(
            hostname = %args.hostname,
            status = %run.status(),
            host_state = ?run.events.host_state,
            tests_failed = run.events.tests_failed(),
            aborted = run.abort.requested(),
            "lucifer exited"
        );
        Ok(run)
    }
}

/// The parser's summary; a panicked parser is an error, since the host
/// state it carried is lost.
fn join_parser(parser: Option<JoinHandle<EventSummary>>, hostname: &str) -> Result<EventSummary> {
    let Some(handle) = parser else {
        return Ok(EventSummary::default());
    };
    handle.join().map_err(|_| {
        tracing::error!(hostname, "lucifer event parser panicked; host state updates are lost");
        anyhow!("lucifer event parser for {} panicked", hostname)
    })
}

fn forward_events(stderr: ChildStderr, tee: Option<AnnotationSink>) -> EventSummary {
    let mut summary = EventSummary::default();
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, "reading lucifer stderr failed");
                break;
            }
        }
        let _ = io::stderr().lock().write_all(&buf);
        let line = String::from_utf8_lossy(&buf);
        if let Some(sink) = &tee {
            if let Err(err) = sink.write_line(&line) {
                tracing::debug!(error = %err, "annotation tee write failed");
            }
        }
        summary.observe_line(&line);
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::is_cancellation;
    use chrono::Utc;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::os::unix::net::UnixDatagram;
    use std::time::Duration;
    use swarming_core::{CancelReason, DutState};

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

    fn fake_lucifer(root: &Path, body: &str) -> Engine {
        let path = root.join("lucifer");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("script");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
        Engine::new(&path, &root.join("autotest"))
    }

    fn admin_args(root: &Path, task: &str) -> EngineArgs {
        EngineArgs {
            task: EngineTask::Admin {
                task: task.to_string(),
            },
            hostname: "chromeos1-row1-rack1-host1".to_string(),
            results_dir: root.to_path_buf(),
            abort_sock: root.join("abort_sock"),
            logdog_file: None,
        }
    }

    #[test]
    fn panicked_event_parser_is_an_error() {
        let handle = thread::spawn(|| -> EventSummary { panic!("bad utf-8 handling") });
        let err = join_parser(Some(handle), "host42").expect_err("panic surfaces");
        assert!(err.to_string().contains("host42"), "{}", err);

        let handle = thread::spawn(|| {
            let mut summary = EventSummary::default();
            summary.observe_line("host_ready");
            summary
        });
        let summary = join_parser(Some(handle), "host42").expect("summary");
        assert_eq!(summary.host_state, Some(DutState::Ready));
        assert_eq!(join_parser(None, "host42").expect("empty"), EventSummary::default());
    }

    #[test]
    fn command_line_follows_task_kind() {
        let engine = Engine::new(Path::new("/opt/lucifer/lucifer"), Path::new("/usr/local/autotest"));
        let mut args = admin_args(Path::new("/r"), "reset");
        assert_eq!(
            engine.args(&args),
            vec![
                "admintask",
                "-autotestdir",
                "/usr/local/autotest",
                "-abortsock",
                "/r/abort_sock",
                "-gcp-project",
                "chromeos-skylab",
                "-hostname",
                "chromeos1-row1-rack1-host1",
                "-resultsdir",
                "/r",
                "-task",
                "reset",
            ]
        );

        args.task = EngineTask::Audit {
            actions: vec!["verify-dut-storage".to_string(), "verify-servo-usb-drive".to_string()],
        };
        args.logdog_file = Some(PathBuf::from("/t/logdog.fifo"));
        let argv = engine.args(&args);
        assert_eq!(argv[0], "audittask");
        assert!(argv.ends_with(&[
            "-logdog-file".to_string(),
            "/t/logdog.fifo".to_string(),
            "-actions".to_string(),
            "verify-dut-storage,verify-servo-usb-drive".to_string(),
        ]));

        args.task = EngineTask::Deploy { actions: vec![] };
        let argv = engine.args(&args);
        assert_eq!(argv[0], "deploytask");
        assert!(!argv.contains(&"-actions".to_string()));
    }

    #[test]
    fn arguments_reach_the_engine() {
        let root = TempDirGuard::new("ssw_lucifer_argv");
        let argv_file = root.path.join("argv");
        let engine = fake_lucifer(
            &root.path,
            &format!("printf '%s\\n' \"$@\" > '{}'", argv_file.display()),
        );
        let args = admin_args(&root.path, "repair");
        let run = engine.run(&args, &CancelToken::new(), None).expect("run");
        assert!(run.succeeded());
        let seen: Vec<String> = fs::read_to_string(&argv_file)
            .expect("argv")
            .lines()
            .map(str::to_string)
            .collect();
        assert_eq!(seen, engine.args(&args));
    }

    #[test]
    fn events_are_folded_and_tee_receives_stderr() {
        let root = TempDirGuard::new("ssw_lucifer_events");
        let engine = fake_lucifer(
            &root.path,
            "echo starting >&2\necho 'lucifer: verifying' >&2\necho host_needs_repair >&2\necho host_ready >&2\necho completed >&2",
        );
        let sink = AnnotationSink::create(&root.path.join("annotations.txt"), "logdog://x").expect("sink");
        let run = engine
            .run(&admin_args(&root.path, "repair"), &CancelToken::new(), Some(&sink))
            .expect("run");
        run.check().expect("success");
        assert_eq!(run.events.host_state, Some(DutState::Ready));
        assert_eq!(run.events.unrecognized, 1);
        assert!(!run.autoserv_failed());
        let tee = fs::read_to_string(sink.path()).expect("tee");
        assert!(tee.contains("lucifer: verifying"));
        assert!(tee.contains("host_ready"));
    }

    #[test]
    fn silent_failure_synthesizes_autoserv() {
        let root = TempDirGuard::new("ssw_lucifer_autoserv");
        let engine = fake_lucifer(&root.path, "echo starting >&2\nexit 2");
        let run = engine
            .run(&admin_args(&root.path, "repair"), &CancelToken::new(), None)
            .expect("run");
        assert_eq!(run.exit_code, Some(2));
        assert!(run.autoserv_synthesized);
        assert!(run.autoserv_failed());
        let err = run.check().expect_err("failure");
        assert!(!is_cancellation(&err));
        assert!(err.to_string().contains("exit code 2"));
    }

    #[test]
    fn reported_test_failures_are_not_autoserv() {
        let root = TempDirGuard::new("ssw_lucifer_testfail");
        let engine = fake_lucifer(&root.path, "echo 'test_failed dummy_Fail' >&2\nexit 1");
        let run = engine
            .run(&admin_args(&root.path, "repair"), &CancelToken::new(), None)
            .expect("run");
        assert!(!run.autoserv_synthesized);
        assert_eq!(run.events.failed_tests, vec!["dummy_Fail".to_string()]);
    }

    #[test]
    fn deadline_forwards_one_abort_and_waits_for_exit() {
        let root = TempDirGuard::new("ssw_lucifer_abort");
        let stop = root.path.join("stop");
        let engine = fake_lucifer(
            &root.path,
            &format!(
                "echo running >&2\nwhile [ ! -e '{}' ]; do sleep 0.05; done\necho aborted >&2\nexit 1",
                stop.display()
            ),
        );
        let args = admin_args(&root.path, "repair");
        let listener = UnixDatagram::bind(&args.abort_sock).expect("bind");
        listener
            .set_read_timeout(Some(Duration::from_secs(10)))
            .expect("timeout");
        let stop_file = stop.clone();
        let engine_side = thread::spawn(move || {
            let mut buf = [0u8; 16];
            let got = listener.recv(&mut buf).is_ok();
            fs::write(&stop_file, "").expect("stop");
            listener.set_nonblocking(true).expect("nonblocking");
            let extra = listener.recv(&mut buf).is_ok();
            (got, extra)
        });

        let cancel = CancelToken::new().with_timeout(Duration::from_millis(200));
        let run = engine.run(&args, &cancel, None).expect("run");
        let (got, extra) = engine_side.join().expect("engine side");
        assert!(got, "abort datagram not received");
        assert!(!extra, "abort sent twice");
        assert_eq!(run.abort.reason, Some(CancelReason::Deadline));
        assert!(run.abort.delivered);
        assert!(!run.autoserv_synthesized);
        assert!(is_cancellation(&run.check().expect_err("cancelled")));
    }

    #[test]
    fn cancelled_token_never_spawns() {
        let root = TempDirGuard::new("ssw_lucifer_precancel");
        let marker = root.path.join("ran");
        let engine = fake_lucifer(&root.path, &format!("touch '{}'", marker.display()));
        let cancel = CancelToken::new();
        cancel.cancel(CancelReason::Signal);
        let err = engine
            .run(&admin_args(&root.path, "repair"), &cancel, None)
            .expect_err("cancelled");
        assert!(is_cancellation(&err));
        assert!(!marker.exists());
    }
}
