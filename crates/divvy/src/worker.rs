//! One slot in the master's pool, and the code its child process runs.

use crate::{signals, task::Task};
use anyhow::Context as _;
use divvy_base::{Result, WorkItem, WorkerNum, WorkerStatus, MAX_FRAME_SIZE};
use nix::{
    errno::Errno,
    sys::{
        signal::{self, Signal},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::{self, ForkResult, Pid},
};
use slog::Logger;
use std::{
    io::{self, Read as _},
    os::unix::net::UnixStream,
    path::Path,
    process,
};

/// A pool slot. The slot number is stable for the master run; the child
/// process behind it is forked lazily and re-forked after a crash. A slot
/// moves `not spawned -> running -> reaped` and is never resurrected: a
/// re-spawn starts the cycle over with a fresh pid.
#[derive(Debug)]
pub struct Worker {
    number: WorkerNum,
    pid: Option<Pid>,
    status: Option<WorkerStatus>,
}

impl Worker {
    pub fn new(number: WorkerNum) -> Self {
        Worker {
            number,
            pid: None,
            status: None,
        }
    }

    pub fn number(&self) -> WorkerNum {
        self.number
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// `true` iff a child has been forked for this slot and not yet reaped.
    pub fn is_running(&self) -> bool {
        self.pid.is_some() && self.status.is_none()
    }

    /// Fork a child for this slot. The parent records the child's pid and
    /// returns. The child runs `post_fork_cleanup` to sever inherited fds,
    /// installs its own signal traps, runs the task's `after_fork` hook and
    /// then its dequeue loop, and never returns: it exits 0 on
    /// end-of-work and 1 if `perform` or an item decode fails.
    pub fn spawn(
        &mut self,
        task: &mut impl Task,
        log: &Logger,
        post_fork_cleanup: impl FnOnce(),
    ) -> Result<()> {
        match unsafe { unistd::fork() }.context("forking worker")? {
            ForkResult::Parent { child } => {
                self.pid = Some(child);
                self.status = None;
                slog::debug!(log, "spawned worker"; "worker" => %self.number, "pid" => child.as_raw());
                Ok(())
            }
            ForkResult::Child => {
                post_fork_cleanup();
                signals::install_child_traps();
                task.after_fork(self);
                match child_main(&*task, log) {
                    Ok(()) => process::exit(0),
                    Err(err) => {
                        slog::error!(log, "worker failed"; "worker" => %self.number, "error" => format!("{err:#}"));
                        process::exit(1);
                    }
                }
            }
        }
    }

    /// Non-blocking reap. Records and returns the exit status if the child
    /// has terminated; `None` while it is still alive, was never spawned,
    /// or was already reaped.
    pub fn reap(&mut self) -> Option<WorkerStatus> {
        let pid = self.pid?;
        if self.status.is_some() {
            return None;
        }
        let status = match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => WorkerStatus::Exited(clip_to_u8(code)),
            Ok(WaitStatus::Signaled(_, signum, _)) => {
                WorkerStatus::Signaled(clip_to_u8(signum as i32))
            }
            // Someone else collected the child. Claim a clean exit rather
            // than leaving the slot running forever.
            Err(Errno::ECHILD) => WorkerStatus::Exited(0),
            Ok(_) | Err(_) => return None,
        };
        self.status = Some(status);
        Some(status)
    }

    /// Send `signal` to the child. A dead or never-spawned child is not an
    /// error; the send just reports `false`.
    pub fn kill(&self, signal: Signal) -> bool {
        let Some(pid) = self.pid else {
            return false;
        };
        signal::kill(pid, signal).is_ok()
    }
}

fn clip_to_u8(val: i32) -> u8 {
    if val < 0 || val > u8::MAX as i32 {
        u8::MAX
    } else {
        val as u8
    }
}

fn child_main(task: &impl Task, log: &Logger) -> Result<()> {
    let socket_path = task.socket_path();
    while let Some(item) = dequeue(&socket_path)? {
        slog::debug!(log, "performing item"; "item" => ?item);
        task.perform(item)?;
        if signals::shutdown_requested() {
            break;
        }
    }
    Ok(())
}

/// Pull one item from the rendezvous socket: a fresh connection per item,
/// one read of at most a frame, connection close as the end-of-item mark.
/// `None` means the master has torn the socket down, or hung up without
/// writing; the worker should exit.
fn dequeue(socket_path: &Path) -> Result<Option<WorkItem>> {
    let stream = loop {
        match UnixStream::connect(socket_path) {
            Ok(stream) => break stream,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
                ) =>
            {
                return Ok(None);
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                if signals::shutdown_requested() {
                    return Ok(None);
                }
            }
            Err(err) => return Err(err).context("connecting to work socket"),
        }
    };
    let mut frame = Vec::with_capacity(1024);
    match stream.take(MAX_FRAME_SIZE as u64).read_to_end(&mut frame) {
        Ok(_) => {}
        // The master hung up mid-shutdown.
        Err(err) if err.kind() == io::ErrorKind::ConnectionReset => return Ok(None),
        Err(err) => return Err(err).context("reading work item"),
    }
    WorkItem::from_frame(&frame)
}
