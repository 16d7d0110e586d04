use crate::worker::Worker;
use divvy_base::{Result, WorkItem};
use std::path::PathBuf;

/// The items a task produces, in dispatch order. The stream owns whatever
/// state production needs; the master pulls it lazily, one item per
/// hand-off, so the pool's capacity is the only thing driving production
/// rate.
pub type ItemStream = Box<dyn Iterator<Item = Result<WorkItem>>>;

/// A unit of coarse-grained parallel work.
///
/// The master calls `dispatch` exactly once, then forks workers and feeds
/// them the produced items one at a time. The task value is copied into
/// every worker at fork time: mutations made in the master after a fork
/// (dispatch-side state included) are invisible to children, and vice
/// versa.
pub trait Task {
    /// Produce the work items. Finite, lazy, not restartable.
    fn dispatch(&mut self) -> Result<ItemStream>;

    /// Process one item. Runs in a worker, at most once per item; an error
    /// ends that worker with a non-zero exit status and the item is not
    /// retried.
    fn perform(&self, item: WorkItem) -> Result<()>;

    /// Hook run in the master immediately before each fork.
    fn before_fork(&mut self, _worker: &Worker) {}

    /// Hook run in the freshly forked child, before its first dequeue.
    fn after_fork(&mut self, _worker: &Worker) {}

    /// Filesystem path of the rendezvous socket. Must fit in `sun_path`.
    fn socket_path(&self) -> PathBuf {
        default_socket_path()
    }
}

/// `<tmp>/divvy-<pid>.sock`, where the pid is the calling process, i.e. the
/// master's. Successive runs of the same master pid reuse the path; bind
/// unlinks whatever is left over.
pub fn default_socket_path() -> PathBuf {
    std::env::temp_dir().join(format!("divvy-{}.sock", std::process::id()))
}
