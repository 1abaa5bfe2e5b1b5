//! Readiness waits over raw descriptors
//!
//! Thin layer over `poll(2)` shared by sessions, servers, workers and the
//! listener. Every wait is bounded so periodic scans keep running.

use crate::error::Result;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::time::Duration;

fn to_poll_timeout(timeout: Duration) -> PollTimeout {
    let ms = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
    PollTimeout::from(ms)
}

/// Wait for readiness on `fds`; returns the number of ready descriptors
///
/// An interrupted wait reports zero ready descriptors.
pub fn wait(fds: &mut [PollFd<'_>], timeout: Duration) -> Result<usize> {
    match poll(fds, to_poll_timeout(timeout)) {
        Ok(n) => Ok(n.max(0) as usize),
        Err(Errno::EINTR) => Ok(0),
        Err(e) => Err(e.into()),
    }
}

/// Readable, or in a state where a read will report the error/EOF
pub fn is_readable(fd: &PollFd<'_>) -> bool {
    fd.revents().is_some_and(|r| {
        r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
    })
}

pub fn is_writable(fd: &PollFd<'_>) -> bool {
    fd.revents()
        .is_some_and(|r| r.intersects(PollFlags::POLLOUT | PollFlags::POLLERR))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    #[test]
    fn test_wait_times_out() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut fds = [PollFd::new(a.as_fd(), PollFlags::POLLIN)];

        let start = Instant::now();
        assert_eq!(wait(&mut fds, Duration::from_millis(30)).unwrap(), 0);
        assert!(start.elapsed() >= Duration::from_millis(25));
        assert!(!is_readable(&fds[0]));
    }

    #[test]
    fn test_wait_reports_readable() {
        let (a, mut b) = UnixStream::pair().unwrap();
        b.write_all(b"x").unwrap();

        let mut fds = [PollFd::new(a.as_fd(), PollFlags::POLLIN | PollFlags::POLLOUT)];
        assert_eq!(wait(&mut fds, Duration::from_millis(100)).unwrap(), 1);
        assert!(is_readable(&fds[0]));
        assert!(is_writable(&fds[0]));
    }
}
