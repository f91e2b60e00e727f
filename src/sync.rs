/// Startup synchronization channel between the supervisor and the process
/// that becomes the container's init.
///
/// Both processes hold one end of a connected socketpair. Every message on
/// the wire is one whole write of a fixed-width signed integer: either a
/// phase sequence number or the reserved `SYNC_ERROR` sentinel. A partial
/// read is a protocol violation, never a valid shorter message; a zero-byte
/// read means the peer closed its end and is treated as benign termination.
use crate::types::{Result, RootboxError};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use std::fmt;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

/// Reserved wire value meaning "the peer hit a fatal error".
///
/// Negative, so it is disjoint from every valid phase sequence number.
pub const SYNC_ERROR: i32 = -1;

/// Named checkpoints of the container start sequence.
///
/// The integer encoding only carries relative order on the wire; the names
/// are labels for logging. `Restart`/`PostRestart` form the alternate path
/// taken on an explicit container restart.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum Phase {
    Startup = 0,
    Configure = 1,
    PostConfigure = 2,
    CgroupLimits = 3,
    IdmappedMounts = 4,
    Fds = 5,
    ReadyStart = 6,
    Restart = 7,
    PostRestart = 8,
}

impl Phase {
    /// Wire encoding of this phase.
    pub fn seq(self) -> i32 {
        self as i32
    }

    /// Successor phase within the same path, if any.
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Startup => Some(Phase::Configure),
            Phase::Configure => Some(Phase::PostConfigure),
            Phase::PostConfigure => Some(Phase::CgroupLimits),
            Phase::CgroupLimits => Some(Phase::IdmappedMounts),
            Phase::IdmappedMounts => Some(Phase::Fds),
            Phase::Fds => Some(Phase::ReadyStart),
            Phase::ReadyStart => None,
            Phase::Restart => Some(Phase::PostRestart),
            Phase::PostRestart => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(seq_name(self.seq()))
    }
}

/// Human-readable name for a wire sequence number, for logging only.
pub fn seq_name(sequence: i32) -> &'static str {
    match sequence {
        SYNC_ERROR => "error",
        0 => "startup",
        1 => "configure",
        2 => "post-configure",
        3 => "cgroup-limits",
        4 => "idmapped-mounts",
        5 => "fds",
        6 => "ready-start",
        7 => "restart",
        8 => "post-restart",
        _ => "invalid sync state",
    }
}

/// Result of a successful `wait`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The expected sequence number arrived.
    Reached,
    /// The peer closed its end with nothing pending. This is the documented
    /// signal that the peer exited normally before reaching this phase.
    PeerClosed,
}

/// One end of the synchronization channel, exclusively owned by a single
/// process after the fork. Closing happens exactly once, when the endpoint
/// is dropped.
#[derive(Debug)]
pub struct SyncEndpoint {
    fd: OwnedFd,
}

impl SyncEndpoint {
    /// Send one whole sequence number to the peer.
    pub fn wake(&self, sequence: i32) -> Result<()> {
        let buf = sequence.to_ne_bytes();
        loop {
            match nix::unistd::write(self.fd.as_raw_fd(), &buf) {
                Ok(n) if n == buf.len() => return Ok(()),
                Ok(n) => {
                    return Err(RootboxError::Resource(format!(
                        "sync wake failure: wrote {} of {} bytes",
                        n,
                        buf.len()
                    )))
                }
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    return Err(RootboxError::Resource(format!("sync wake failure: {}", err)))
                }
            }
        }
    }

    /// Send the error sentinel so the peer's pending `wait` resolves to
    /// `RemoteFailure` instead of blocking indefinitely.
    pub fn wake_error(&self) -> Result<()> {
        self.wake(SYNC_ERROR)
    }

    /// Block until the peer sends `sequence`.
    ///
    /// A clean end-of-channel read is not an error: the peer exited before
    /// reaching this phase and the caller must treat the wait as satisfied.
    pub fn wait(&self, sequence: i32) -> Result<WaitOutcome> {
        let mut buf = [0u8; 4];
        let n = loop {
            match nix::unistd::read(self.fd.as_raw_fd(), &mut buf) {
                Ok(n) => break n,
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    return Err(RootboxError::Resource(format!("sync wait failure: {}", err)))
                }
            }
        };

        if n == 0 {
            log::trace!("peer closed sync channel while waiting for {}", seq_name(sequence));
            return Ok(WaitOutcome::PeerClosed);
        }

        if n != buf.len() {
            return Err(RootboxError::Protocol(format!(
                "unexpected sync size: {} expected {}",
                n,
                buf.len()
            )));
        }

        let value = i32::from_ne_bytes(buf);
        if value == SYNC_ERROR {
            return Err(RootboxError::RemoteFailure(sequence));
        }

        if value != sequence {
            return Err(RootboxError::Protocol(format!(
                "invalid sequence number {} ({}), expected {} ({})",
                value,
                seq_name(value),
                sequence,
                seq_name(sequence)
            )));
        }

        Ok(WaitOutcome::Reached)
    }

    /// Announce completion of `sequence`, then block until the peer
    /// acknowledges with `sequence + 1`.
    pub fn barrier(&self, sequence: i32) -> Result<WaitOutcome> {
        log::trace!(
            "waking peer with sequence {} and waiting for sequence {}",
            seq_name(sequence),
            seq_name(sequence + 1)
        );
        self.wake(sequence)?;
        self.wait(sequence + 1)
    }
}

impl AsRawFd for SyncEndpoint {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for SyncEndpoint {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// A connected duplex pair created once per container-start attempt,
/// before the fork. After the fork each side keeps exactly one endpoint
/// and drops the other, so no descriptor is closed twice or by the wrong
/// process.
#[derive(Debug)]
pub struct SyncChannel {
    supervisor: SyncEndpoint,
    child: SyncEndpoint,
}

impl SyncChannel {
    /// Create the connected socketpair.
    ///
    /// The supervisor-held endpoint is marked close-on-exec so a later
    /// exec in the child does not leak it into the container.
    pub fn establish() -> Result<SyncChannel> {
        let (sup, child) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .map_err(|e| {
            RootboxError::Resource(format!("failed to create synchronization socketpair: {}", e))
        })?;

        fcntl(sup.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(|e| {
            RootboxError::Resource(format!("failed to make sync socket close-on-exec: {}", e))
        })?;

        log::trace!("initialized synchronization socketpair");
        Ok(SyncChannel {
            supervisor: SyncEndpoint { fd: sup },
            child: SyncEndpoint { fd: child },
        })
    }

    /// Keep the supervisor endpoint, closing the child's.
    pub fn into_supervisor(self) -> SyncEndpoint {
        self.supervisor
    }

    /// Keep the child endpoint, closing the supervisor's.
    pub fn into_child(self) -> SyncEndpoint {
        self.child
    }

    /// Take both endpoints. Used when both sides of the protocol run in
    /// one process, e.g. across threads in tests.
    pub fn split(self) -> (SyncEndpoint, SyncEndpoint) {
        (self.supervisor, self.child)
    }
}
