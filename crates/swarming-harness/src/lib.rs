//! Task and DUT harness for the Skylab Swarming worker.
//!
//! A task opens a [`TaskHarness`], which owns the results directory and one
//! [`DutHarness`] per DUT. The [`TaskRunner`] drives the engine for each
//! open DUT and closes everything in reverse order.

mod abort;
mod annotations;
mod botconfig;
mod dutharness;
mod errors;
mod events;
mod harness;
mod hostinfo;
mod localstate;
mod lucifer;
mod results;
mod resultsdir;
mod runner;
mod sideeffects;
mod writeback;

pub use abort::{send_abort, AbortOutcome, AbortWatcher};
pub use annotations::{AnnotationSink, FifoCopier};
pub use botconfig::BotConfig;
pub use dutharness::{DutHarness, Writeback};
pub use errors::{is_cancellation, MultiError, TaskError};
pub use events::{next_state, parse_line, Event, EventSummary, AUTOSERV_SENTINEL};
pub use harness::{HarnessOptions, TaskHarness};
pub use hostinfo::HostInfo;
pub use localstate::{
    LocalDutState, LocalStateFiles, PROVISIONABLE_ATTRIBUTES, PROVISIONABLE_LABELS,
};
pub use lucifer::{Engine, EngineArgs, EngineRun, EngineTask, GCP_PROJECT};
pub use results::{write_task_results, DutResult};
pub use resultsdir::ResultsDir;
pub use runner::{TaskArgs, TaskKind, TaskReport, TaskRunner};
pub use sideeffects::{GoogleStorageConfig, SideEffectsConfig, TkoConfig};
pub use writeback::dut_state_update;
