/// Startup sequencer: the per-attempt state machine driven cooperatively by
/// the supervisor and the container child over a [`SyncEndpoint`].
///
/// Ownership of which side performs which phase's work is fixed by protocol
/// convention: the child sets up namespaces and mounts, the supervisor sets
/// up cgroup limits and device nodes. The failing side never calls the
/// normal barrier; it sends the error sentinel instead so the peer aborts
/// rather than blocking forever or proceeding into an inconsistent phase.
///
/// There is no retry and no built-in timeout. A caller that wants a
/// deadline must poll [`StartupSequencer::as_raw_fd`] for readiness
/// externally and treat expiry like a local failure (call `abort`).
use crate::sync::{seq_name, Phase, SyncEndpoint, WaitOutcome};
use crate::types::{Result, RootboxError};

use std::os::fd::{AsRawFd, RawFd};

/// Which process this sequencer instance runs in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Supervisor,
    Child,
}

impl Role {
    fn name(self) -> &'static str {
        match self {
            Role::Supervisor => "supervisor",
            Role::Child => "child",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    /// No phase driven yet; only `Startup` or `Restart` may enter.
    Idle,
    /// Last sequence number this side has seen on the wire, and whether
    /// the attempt entered through the restart path. The two paths never
    /// mix within one attempt.
    Running { last: i32, restart: bool },
    /// Absorbing terminal state, reached on any failure or after `abort`.
    Failed,
}

/// Drives the ordered phase list for one container-start attempt.
pub struct StartupSequencer {
    endpoint: SyncEndpoint,
    role: Role,
    state: State,
}

impl StartupSequencer {
    pub fn new(role: Role, endpoint: SyncEndpoint) -> StartupSequencer {
        StartupSequencer {
            endpoint,
            role,
            state: State::Idle,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Run the local setup work this side owns for `phase`, then rendezvous
    /// with the peer.
    ///
    /// On work failure the sentinel is sent in place of the barrier and the
    /// work's error is returned; the sequencer is terminal afterwards.
    pub fn run_phase<F>(&mut self, phase: Phase, work: F) -> Result<WaitOutcome>
    where
        F: FnOnce() -> Result<()>,
    {
        let restart = self.check_order(phase.seq())?;
        log::debug!("{}: running phase {}", self.role.name(), phase);

        if let Err(err) = work() {
            log::warn!("{}: phase {} failed: {}", self.role.name(), phase, err);
            self.abort();
            return Err(err);
        }

        log::trace!(
            "{} waking peer with sequence {} and waiting for sequence {}",
            self.role.name(),
            phase,
            seq_name(phase.seq() + 1)
        );
        match self.endpoint.barrier(phase.seq()) {
            Ok(outcome) => {
                self.state = State::Running {
                    last: phase.seq() + 1,
                    restart,
                };
                Ok(outcome)
            }
            Err(err) => {
                self.state = State::Failed;
                Err(err)
            }
        }
    }

    /// Block until the peer announces `phase`. Used for phases whose setup
    /// work the other side owns.
    pub fn await_phase(&mut self, phase: Phase) -> Result<WaitOutcome> {
        let restart = self.check_order(phase.seq())?;
        log::trace!("{} waiting for peer with sequence {}", self.role.name(), phase);
        match self.endpoint.wait(phase.seq()) {
            Ok(outcome) => {
                self.state = State::Running {
                    last: phase.seq(),
                    restart,
                };
                Ok(outcome)
            }
            Err(err) => {
                self.state = State::Failed;
                Err(err)
            }
        }
    }

    /// Announce `phase` without expecting a reply. Used for asymmetric
    /// points such as the final ready signal.
    pub fn announce(&mut self, phase: Phase) -> Result<()> {
        let restart = self.check_order(phase.seq())?;
        log::trace!("{} waking peer with sequence {}", self.role.name(), phase);
        match self.endpoint.wake(phase.seq()) {
            Ok(()) => {
                self.state = State::Running {
                    last: phase.seq(),
                    restart,
                };
                Ok(())
            }
            Err(err) => {
                self.state = State::Failed;
                Err(err)
            }
        }
    }

    /// Send the error sentinel and enter the terminal state. Idempotent;
    /// safe to call when the channel is already gone.
    pub fn abort(&mut self) {
        if self.state == State::Failed {
            return;
        }
        if let Err(err) = self.endpoint.wake_error() {
            log::warn!("{}: failed to signal abort to peer: {}", self.role.name(), err);
        }
        self.state = State::Failed;
    }

    /// Whether this attempt has reached the terminal error state.
    pub fn failed(&self) -> bool {
        self.state == State::Failed
    }

    /// Validate that `seq` may follow what this side has seen so far and
    /// return whether the attempt is on the restart path.
    fn check_order(&self, seq: i32) -> Result<bool> {
        let restart_branch =
            seq == Phase::Restart.seq() || seq == Phase::PostRestart.seq();

        match self.state {
            State::Failed => Err(RootboxError::Protocol(
                "start attempt already aborted".to_string(),
            )),
            State::Idle => {
                if seq == Phase::Startup.seq() || seq == Phase::Restart.seq() {
                    Ok(restart_branch)
                } else {
                    Err(RootboxError::Protocol(format!(
                        "phase {} cannot begin a start attempt",
                        seq_name(seq)
                    )))
                }
            }
            State::Running { last, restart } => {
                if restart_branch != restart {
                    return Err(RootboxError::Protocol(format!(
                        "phase {} is not part of the {} path",
                        seq_name(seq),
                        if restart { "restart" } else { "normal start" }
                    )));
                }
                if seq > last {
                    Ok(restart)
                } else {
                    Err(RootboxError::Protocol(format!(
                        "phase {} requested after {}",
                        seq_name(seq),
                        seq_name(last)
                    )))
                }
            }
        }
    }
}

impl AsRawFd for StartupSequencer {
    /// The channel descriptor, for callers multiplexing an external
    /// deadline over the blocking protocol.
    fn as_raw_fd(&self) -> RawFd {
        self.endpoint.as_raw_fd()
    }
}
