use std::cell::RefCell;
use std::collections::VecDeque;

/// How many uncaught errors are kept per thread; older ones are dropped first
pub const UNCAUGHT_CAPACITY: usize = 64;

thread_local! {
    // Failures raised by passes that ran inside an effect, with no caller to return to
    static UNCAUGHT: RefCell<VecDeque<ReconcileError>> = const { RefCell::new(VecDeque::new()) };
}

/// Errors from scope operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ScopeError {
    /// No scope is current on this thread
    #[error("no active scope")]
    NoActiveScope,
    /// The scope is disposed or disposing
    #[error("scope is disposed")]
    Disposed,
}

/// Errors from a reconciliation pass
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// The handler failed for one key. The key stays registered.
    #[error("handler failed for key {key}")]
    Handler {
        /// `Debug` rendering of the key
        key: String,
        /// What the handler returned
        #[source]
        source: anyhow::Error,
    },
    /// More than one handler failed in the same pass
    #[error("{} handlers failed", .0.len())]
    Handlers(Vec<ReconcileError>),
    /// The reconciler (or the scope it lives in) is disposed
    #[error("reconciler is disposed")]
    Disposed,
}

impl ReconcileError {
    /// Fold the failures of one pass into a single error
    pub(crate) fn collect(mut failures: Vec<ReconcileError>) -> Option<Self> {
        match failures.len() {
            0 => None,
            1 => failures.pop(),
            _ => Some(ReconcileError::Handlers(failures)),
        }
    }

    /// Keys whose handler failed, in pass order
    pub fn failed_keys(&self) -> Vec<&str> {
        match self {
            ReconcileError::Handler { key, .. } => vec![key.as_str()],
            ReconcileError::Handlers(errors) => {
                errors.iter().flat_map(ReconcileError::failed_keys).collect()
            }
            ReconcileError::Disposed => Vec::new(),
        }
    }
}

/// Park an error raised where nobody can receive it
pub(crate) fn report_uncaught(error: ReconcileError) {
    tracing::error!(error = %error, keys = ?error.failed_keys(), "reconcile pass failed");
    UNCAUGHT.with(|uncaught| {
        let mut uncaught = uncaught.borrow_mut();
        if uncaught.len() == UNCAUGHT_CAPACITY {
            cov_mark::hit!(uncaught_error_dropped);
            uncaught.pop_front();
        }
        uncaught.push_back(error);
    });
}

/// Drain the errors raised by reconcile passes that ran inside effects on this thread
///
/// A pass triggered by a key-set change runs inside the watcher effect, so a
/// failing handler has no caller to return to. Its error lands here (and in a
/// `tracing::error!` event) until taken, oldest first. Only the last
/// [`UNCAUGHT_CAPACITY`] errors are kept: a thread that never drains loses
/// the older ones but still sees them in the log.
pub fn take_uncaught_errors() -> Vec<ReconcileError> {
    UNCAUGHT.with(|uncaught| uncaught.borrow_mut().drain(..).collect())
}
