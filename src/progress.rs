use std::fmt;
use std::time::Duration;
use thousands::*;

/// Checkpoints reported during index construction
#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    /// The random projection forest is complete
    ForestBuilt { n_trees: usize, elapsed: Duration },
    /// The refinement loop is about to start
    DescentStarted {
        n_iters: usize,
        n: usize,
        max_candidates: usize,
    },
    /// One local join round is complete
    RoundFinished {
        iter: usize,
        n_iters: usize,
        updates: usize,
    },
    /// The update count fell below the convergence threshold
    Converged { iter: usize },
    /// The caller's time budget ran out before convergence
    TimeBudgetExhausted { iter: usize },
    /// Construction is complete
    DescentFinished { converged: bool, elapsed: Duration },
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressEvent::ForestBuilt { n_trees, elapsed } => {
                write!(f, "Built RP forest with {n_trees} trees: {elapsed:.2?}")
            }
            ProgressEvent::DescentStarted {
                n_iters,
                n,
                max_candidates,
            } => write!(
                f,
                "Running NN-Descent for {n_iters} iterations: {} samples, max_candidates={max_candidates}",
                n.separate_with_underscores()
            ),
            ProgressEvent::RoundFinished {
                iter,
                n_iters,
                updates,
            } => write!(
                f,
                "  Iter {iter} / {n_iters}: {} edge updates",
                updates.separate_with_underscores()
            ),
            ProgressEvent::Converged { iter } => {
                write!(f, "  Converged after {iter} iterations")
            }
            ProgressEvent::TimeBudgetExhausted { iter } => {
                write!(f, "  Stopped after {iter} iterations: time budget exhausted")
            }
            ProgressEvent::DescentFinished { converged, elapsed } => {
                write!(f, "Total time: {elapsed:.2?} (converged = {converged})")
            }
        }
    }
}

/// Receiver of progress events
///
/// Invoked synchronously from the building thread, never from a worker.
/// Only called at all when verbosity is requested.
pub trait ProgressObserver: Send + Sync {
    fn on_event(&self, event: &ProgressEvent);
}

/// Prints every event as one line to stdout
#[derive(Clone, Copy, Debug, Default)]
pub struct StdoutObserver;

impl ProgressObserver for StdoutObserver {
    fn on_event(&self, event: &ProgressEvent) {
        println!("{event}");
    }
}

impl<F> ProgressObserver for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn on_event(&self, event: &ProgressEvent) {
        self(event)
    }
}

/// Gate between the engine and an optional observer
///
/// Holds no observer at all when verbosity is off, so nothing can be
/// invoked.
pub(crate) struct Reporter<'a> {
    observer: Option<&'a dyn ProgressObserver>,
}

impl<'a> Reporter<'a> {
    pub(crate) fn new(verbose: bool, observer: &'a dyn ProgressObserver) -> Self {
        Self {
            observer: verbose.then_some(observer),
        }
    }

    #[inline]
    pub(crate) fn emit(&self, event: ProgressEvent) {
        if let Some(observer) = self.observer {
            observer.on_event(&event);
        }
    }
}

///////////
// Tests //
///////////
