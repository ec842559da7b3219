//! Read-readiness notification for raw socket descriptors.
//!
//! [`poll_read`] arms a one-shot notification that fires when a socket has
//! data to read (or its peer went away) without consuming anything from the
//! stream. The descriptor is duplicated and the duplicate is registered with
//! the runtime reactor (epoll on Linux, kqueue on the BSDs and macOS), so
//! the socket's own registration is left untouched and the notification can
//! outlive borrows of the stream.
//!
//! A registration fires at most once and unregisters itself when it does.
//! Dropping the [`PollGuard`] before the event fires releases the
//! registration and resolves the waiter with [`ReadEvent::Cancelled`];
//! dropping it afterwards is a no-op. Either way no registration is leaked.

use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::oneshot;

use crate::conn::Stream;

/// Outcome of a readiness wait.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadEvent {
    /// The descriptor has data available (or the peer closed).
    Ready,
    /// The registration was cancelled before anything happened.
    Cancelled,
}

/// Receiving end of a readiness registration.
#[derive(Debug)]
pub struct ReadReady {
    rx: oneshot::Receiver<io::Result<()>>,
}

impl ReadReady {
    /// Resolves when the descriptor becomes readable or the registration is
    /// cancelled.
    pub async fn wait(self) -> io::Result<ReadEvent> {
        match self.rx.await {
            Ok(Ok(())) => Ok(ReadEvent::Ready),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(ReadEvent::Cancelled),
        }
    }
}

/// Cancellation handle for a readiness registration. Dropping it cancels the
/// registration if it has not fired yet.
#[derive(Debug)]
pub struct PollGuard {
    cancel: Option<oneshot::Sender<()>>,
}

impl PollGuard {
    /// Cancels the registration. Calling this after the event fired has no
    /// effect.
    pub fn cancel(mut self) {
        self.fire();
    }

    fn fire(&mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for PollGuard {
    fn drop(&mut self) {
        self.fire();
    }
}

/// Arms a one-shot read-readiness notification for `stream`.
///
/// Fails with [`io::ErrorKind::Unsupported`] when the stream is not backed
/// by an OS descriptor.
pub fn poll_read(stream: &dyn Stream) -> io::Result<(ReadReady, PollGuard)> {
    let fd = stream.raw_fd().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::Unsupported,
            "stream is not backed by an OS descriptor",
        )
    })?;
    poll_read_fd(fd)
}

/// Arms a one-shot read-readiness notification for the descriptor `fd`.
pub fn poll_read_fd(fd: RawFd) -> io::Result<(ReadReady, PollGuard)> {
    let dup = dup_nonblocking(fd)?;
    let afd = AsyncFd::with_interest(dup, Interest::READABLE)?;

    let (ready_tx, ready_rx) = oneshot::channel();
    let (cancel_tx, cancel_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        tokio::select! {
            res = afd.readable() => {
                let _ = ready_tx.send(res.map(|_guard| ()));
            }
            _ = cancel_rx => {}
        }
        // afd drops here: the duplicate descriptor is unregistered from the
        // reactor and closed.
    });

    Ok((
        ReadReady { rx: ready_rx },
        PollGuard {
            cancel: Some(cancel_tx),
        },
    ))
}

fn dup_nonblocking(fd: RawFd) -> io::Result<OwnedFd> {
    // The duplicate shares the open file description but carries its own
    // reactor registration; close-on-exec keeps it from leaking into
    // spawned processes.
    let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
    if dup < 0 {
        return Err(io::Error::last_os_error());
    }
    let owned = unsafe { OwnedFd::from_raw_fd(dup) };

    let flags = unsafe { libc::fcntl(dup, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(dup, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(owned)
}
