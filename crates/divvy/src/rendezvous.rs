//! The one-shot hand-off point between the master and idle workers.

use anyhow::Context as _;
use divvy_base::Result;
use nix::{
    sys::socket::{self, AddressFamily, SockFlag, SockType, UnixAddr},
    unistd::{self, Pid},
};
use std::{
    fs,
    io::{self, Write as _},
    os::{
        fd::{AsRawFd, FromRawFd as _, RawFd},
        unix::net::{UnixListener, UnixStream},
    },
    path::{Path, PathBuf},
};

/// A unix-domain stream socket where one accepted connection carries
/// exactly one work item: the master writes the frame in full and hangs
/// up, and the close marks end-of-item. A worker is idle iff it is blocked
/// in `connect`, so the kernel's accept queue picks the recipient.
#[derive(Debug)]
pub struct Rendezvous {
    listener: UnixListener,
    path: PathBuf,
    owner: Pid,
}

impl Rendezvous {
    /// Bind the socket, unlinking any stale file at `path` first. A
    /// concurrent master on the same path loses its socket; stale-file
    /// cleanup wins that race on purpose.
    pub fn bind(path: &Path, backlog: usize) -> Result<Self> {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("unlinking stale socket `{}`", path.display()));
            }
        }
        let listener = bind_listener(path, backlog)
            .with_context(|| format!("binding work socket `{}`", path.display()))?;
        Ok(Rendezvous {
            listener,
            path: path.to_owned(),
            owner: unistd::getpid(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until one idle worker connects, then hand it `frame` and hang
    /// up. Accepts on the raw fd: std's `accept` retries `EINTR` behind the
    /// caller's back, and the master needs the `ErrorKind::Interrupted`
    /// return to consult its signal flags between attempts.
    pub fn hand_off(&self, frame: &[u8]) -> io::Result<()> {
        let fd = socket::accept(self.listener.as_raw_fd())
            .map_err(|errno| io::Error::from_raw_os_error(errno as i32))?;
        let mut stream = unsafe { UnixStream::from_raw_fd(fd) };
        stream.write_all(frame)
    }
}

impl AsRawFd for Rendezvous {
    fn as_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}

/// Unlink on drop, but only in the process that bound the socket: a forked
/// worker unwinding its copy must not take the master's socket with it.
impl Drop for Rendezvous {
    fn drop(&mut self) {
        if unistd::getpid() == self.owner {
            let _ = fs::remove_file(&self.path);
        }
    }
}

fn bind_listener(path: &Path, backlog: usize) -> Result<UnixListener> {
    let fd = socket::socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )
    .context("creating socket")?;
    let bound = (|| {
        let addr = UnixAddr::new(path)?;
        socket::bind(fd, &addr)?;
        socket::listen(fd, backlog)
    })();
    match bound {
        Ok(()) => Ok(unsafe { UnixListener::from_raw_fd(fd) }),
        Err(err) => {
            let _ = unistd::close(fd);
            Err(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{io::Read as _, os::unix::net::UnixStream, thread};
    use tempfile::TempDir;

    #[test]
    fn bind_creates_and_drop_unlinks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("work.sock");
        let rendezvous = Rendezvous::bind(&path, 2).unwrap();
        assert_eq!(rendezvous.path(), path);
        assert!(path.exists());
        drop(rendezvous);
        assert!(!path.exists());
    }

    #[test]
    fn bind_unlinks_stale_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("work.sock");
        let first = Rendezvous::bind(&path, 1).unwrap();
        // A second master on the same path disrupts the first. Intentional.
        let second = Rendezvous::bind(&path, 1).unwrap();
        assert!(path.exists());
        drop(second);
        assert!(!path.exists());
        drop(first);
    }

    #[test]
    fn bind_failure_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("no-such-dir").join("work.sock");
        let message = format!("{:#}", Rendezvous::bind(&path, 1).unwrap_err());
        assert!(
            message.contains("binding work socket"),
            "message: {message:?}"
        );
    }

    #[test]
    fn one_connection_carries_one_frame() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("work.sock");
        let rendezvous = Rendezvous::bind(&path, 1).unwrap();
        let reader = thread::spawn({
            let path = path.clone();
            move || {
                let mut stream = UnixStream::connect(path).unwrap();
                let mut frame = vec![];
                stream.read_to_end(&mut frame).unwrap();
                frame
            }
        });
        rendezvous.hand_off(b"[1,2]").unwrap();
        assert_eq!(reader.join().unwrap(), b"[1,2]");
    }

    #[test]
    fn connect_after_drop_fails_fast() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("work.sock");
        drop(Rendezvous::bind(&path, 1).unwrap());
        assert_eq!(
            UnixStream::connect(&path).unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
    }
}
