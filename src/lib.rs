//! Rootbox: the lifecycle core of a Linux container runtime.
//!
//! Two cooperating pieces: a two-process startup synchronization protocol
//! that rendezvous a supervising process with the process becoming the
//! container's init, and the storage-backend abstraction that protocol
//! invokes mid-sequence to provision and bind-mount the container's root
//! filesystem.

pub mod dir;
pub mod ingest;
pub mod mntopts;
pub mod sequencer;
pub mod storage;
pub mod sync;
pub mod types;
