//! The long-lived coordinating process.

use crate::{config::Slots, rendezvous::Rendezvous, signals, task::Task, worker::Worker};
use anyhow::Context as _;
use divvy_base::{Result, WorkerNum};
use nix::unistd;
use slog::Logger;
use std::{io, os::fd::AsRawFd as _, thread, time::Duration};

/// How often the shutdown drain polls for reapable children.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Counters for one completed run.
#[derive(Debug, Default, Eq, PartialEq)]
pub struct RunSummary {
    /// Items handed off to a worker.
    pub dispatched: u64,
    /// Items refused at the master because they serialize over the frame
    /// limit.
    pub skipped: u64,
    /// Items that went undelivered because the worker died between its
    /// connect and the master's write.
    pub lost: u64,
    /// Workers reaped with an unclean exit status.
    pub worker_failures: u64,
}

/// Runs a task to completion: every item the dispatch generator produces is
/// offered to the pool in order, each to exactly one worker, and then the
/// pool is shut down.
///
/// The master blocks in `accept` while every worker is busy, so the
/// generator is pulled at exactly the rate the pool can process.
pub struct Master<TaskT> {
    task: TaskT,
    workers: Vec<Worker>,
    log: Logger,
}

impl<TaskT: Task> Master<TaskT> {
    /// Construct the pool records. Nothing is forked until `run` has an
    /// item to hand off.
    pub fn new(task: TaskT, slots: Slots, log: Logger) -> Self {
        let workers = (1..=slots.into_inner())
            .map(|number| Worker::new(WorkerNum(number)))
            .collect();
        Master { task, workers, log }
    }

    /// Distribute every produced item, then shut the pool down. Returns
    /// early, but still cleanly and fully drained, when a shutdown signal
    /// arrives; in-flight items are allowed to finish. Fails fatally if the
    /// rendezvous socket cannot be bound.
    pub fn run(&mut self) -> Result<RunSummary> {
        signals::install_master_traps().context("installing signal handlers")?;
        let rendezvous = Rendezvous::bind(&self.task.socket_path(), self.workers.len())?;
        slog::debug!(
            self.log, "listening";
            "socket" => %rendezvous.path().display(),
            "slots" => self.workers.len()
        );
        let mut summary = RunSummary::default();
        let result = self.dispatch_all(&rendezvous, &mut summary);
        // Tearing the socket down first makes the pending connects of idle
        // workers fail fast; they exit on their own.
        drop(rendezvous);
        self.drain(&mut summary);
        result.map(|()| summary)
    }

    fn dispatch_all(&mut self, rendezvous: &Rendezvous, summary: &mut RunSummary) -> Result<()> {
        let generator = self.task.dispatch()?;
        for item in generator {
            let item = item.context("task dispatch failed")?;
            let frame = match item.to_frame() {
                Ok(frame) => frame,
                Err(err) => {
                    slog::warn!(self.log, "skipping work item"; "error" => %err);
                    summary.skipped += 1;
                    continue;
                }
            };
            if !self.hand_off(rendezvous, &frame, summary)? {
                return Ok(());
            }
            if signals::shutdown_requested() {
                slog::info!(self.log, "shutdown requested, letting in-flight items finish");
                return Ok(());
            }
            if signals::take_child_exited() {
                self.reap_exited(summary);
            }
        }
        Ok(())
    }

    /// One hand-off: make sure the pool is booted, block in `accept` until
    /// an idle worker connects, write the frame, hang up. Returns `false`
    /// when a shutdown signal arrived while no worker had connected yet; in
    /// that case the in-hand item is dropped unwritten, since the workers
    /// it would wait for may themselves be exiting.
    fn hand_off(
        &mut self,
        rendezvous: &Rendezvous,
        frame: &[u8],
        summary: &mut RunSummary,
    ) -> Result<bool> {
        loop {
            if signals::take_child_exited() {
                self.reap_exited(summary);
            }
            self.boot(rendezvous)?;
            match rendezvous.hand_off(frame) {
                Ok(()) => {
                    summary.dispatched += 1;
                    return Ok(true);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                    if signals::shutdown_requested() {
                        slog::info!(self.log, "shutdown requested while waiting for an idle worker");
                        return Ok(false);
                    }
                    // A CHLD interrupted the accept. Loop: the reap above
                    // frees the slot and boot re-forks it, so a crashed
                    // worker cannot strand the item.
                }
                Err(err) if err.kind() == io::ErrorKind::ConnectionAborted => {
                    // The queued worker vanished before we could accept.
                    // Nothing was written; offer the item again.
                }
                Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                    // The worker died between connect and our write. The
                    // item went with it; delivery is at most once.
                    slog::warn!(self.log, "worker hung up during hand-off, item lost");
                    summary.lost += 1;
                    return Ok(true);
                }
                Err(err) => return Err(err).context("handing off work item"),
            }
        }
    }

    /// Fork a child for every slot that is not currently running. Lazy and
    /// idempotent: live slots are untouched, so calling this once per
    /// hand-off re-forks exactly the slots whose children have been reaped.
    fn boot(&mut self, rendezvous: &Rendezvous) -> Result<()> {
        let Master { task, workers, log } = self;
        let listener_fd = rendezvous.as_raw_fd();
        for worker in workers.iter_mut() {
            if worker.is_running() {
                continue;
            }
            task.before_fork(worker);
            worker.spawn(task, log, || {
                // The child must hold neither the server end of the socket
                // nor the master's stdin.
                let _ = unistd::close(listener_fd);
                let _ = unistd::close(0);
            })?;
        }
        Ok(())
    }

    fn reap_exited(&mut self, summary: &mut RunSummary) {
        for worker in &mut self.workers {
            let Some(status) = worker.reap() else {
                continue;
            };
            if status.is_clean() {
                slog::debug!(self.log, "reaped worker"; "worker" => %worker.number(), "status" => %status);
            } else {
                slog::warn!(self.log, "reaped worker"; "worker" => %worker.number(), "status" => %status);
                summary.worker_failures += 1;
            }
        }
    }

    /// Reap until the pool is empty. Workers still blocked in `connect`
    /// find the socket gone and exit on their own.
    // TODO: escalate to SIGTERM/SIGKILL after a bounded wait, for workers
    // stuck inside a perform that never returns.
    fn drain(&mut self, summary: &mut RunSummary) {
        loop {
            self.reap_exited(summary);
            if !self.workers.iter().any(Worker::is_running) {
                return;
            }
            thread::sleep(DRAIN_POLL_INTERVAL);
        }
    }
}
