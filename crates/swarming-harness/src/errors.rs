use swarming_core::CancelReason;
use swarming_fleet::{FleetError, FleetErrorKind};
use thiserror::Error;

/// The task stopped because it was cancelled, not because something failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("task cancelled: {reason}")]
    Cancelled { reason: CancelReason },
}

/// Errors gathered from independent steps that all ran to completion.
#[derive(Debug, Default, Error)]
#[error("{}", render(.errors))]
pub struct MultiError {
    errors: Vec<anyhow::Error>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: anyhow::Error) {
        self.errors.push(err);
    }

    /// Records the error of `result`, if any.
    pub fn collect<T>(&mut self, result: anyhow::Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.errors.push(err);
                None
            }
        }
    }

    pub fn extend(&mut self, other: MultiError) {
        self.errors.extend(other.errors);
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[anyhow::Error] {
        &self.errors
    }

    pub fn is_cancelled(&self) -> bool {
        self.errors.iter().any(is_cancellation)
    }

    /// True when there is at least one error and every one is a cancellation.
    pub fn only_cancelled(&self) -> bool {
        !self.errors.is_empty() && self.errors.iter().all(is_cancellation)
    }

    pub fn into_result(self) -> anyhow::Result<()> {
        match self.errors.len() {
            0 => Ok(()),
            _ => Err(anyhow::Error::new(self)),
        }
    }
}

fn render(errors: &[anyhow::Error]) -> String {
    match errors {
        [] => "no errors".to_string(),
        [only] => format!("{:#}", only),
        _ => {
            let entries: Vec<String> = errors.iter().map(|err| format!("[{:#}]", err)).collect();
            format!("{} errors: {}", errors.len(), entries.join(" "))
        }
    }
}

/// Walks the error chain looking for a cancellation, from the task, the
/// fleet client or a nested multi-error.
pub fn is_cancellation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if cause.downcast_ref::<TaskError>().is_some() {
            return true;
        }
        if let Some(fleet) = cause.downcast_ref::<FleetError>() {
            return fleet.kind() == FleetErrorKind::Cancelled;
        }
        if let Some(multi) = cause.downcast_ref::<MultiError>() {
            return multi.only_cancelled();
        }
        false
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Context};

    #[test]
    fn display_lists_every_entry() {
        let mut errs = MultiError::new();
        errs.push(anyhow!("close local state"));
        errs.push(anyhow!("write back host1"));
        let rendered = errs.to_string();
        assert!(rendered.starts_with("2 errors:"));
        assert!(rendered.contains("close local state"));
        assert!(rendered.contains("write back host1"));
    }

    #[test]
    fn single_entry_renders_its_whole_chain() {
        let mut errs = MultiError::new();
        errs.push(anyhow!("Is a directory").context("save local state for host42"));
        let err = errs.into_result().expect_err("one error");
        assert_eq!(err.to_string(), "save local state for host42: Is a directory");
        assert!(err.downcast_ref::<MultiError>().is_some());
    }

    #[test]
    fn cancellation_is_found_through_context() {
        let err = anyhow::Error::new(TaskError::Cancelled {
            reason: CancelReason::Deadline,
        })
        .context("run engine for host1");
        assert!(is_cancellation(&err));
        assert!(!is_cancellation(&anyhow!("plain failure")));

        let fleet = anyhow::Error::new(FleetError::Cancelled {
            method: "GetMachine".to_string(),
            reason: CancelReason::Signal,
        });
        assert!(is_cancellation(&fleet));
    }

    #[test]
    fn only_cancelled_requires_every_entry() {
        let mut errs = MultiError::new();
        errs.push(anyhow::Error::new(TaskError::Cancelled {
            reason: CancelReason::Signal,
        }));
        assert!(errs.only_cancelled());
        errs.push(anyhow!("writeback failed"));
        assert!(errs.is_cancelled());
        assert!(!errs.only_cancelled());
    }

    #[test]
    fn empty_multi_error_is_ok() {
        assert!(MultiError::new().into_result().is_ok());
        let mut errs = MultiError::new();
        assert_eq!(errs.collect(Err::<(), _>(anyhow!("x")).context("step")), None);
        assert!(errs.into_result().is_err());
    }
}
