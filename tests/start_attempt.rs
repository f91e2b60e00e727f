//! End-to-end unprivileged start attempt: both sides of the protocol run
//! in one process across threads (socketpair semantics are identical to
//! the post-fork case), with the child provisioning a directory backing
//! store inside its configure phase.

use rootbox::sequencer::{Role, StartupSequencer};
use rootbox::storage::{default_drivers, find_driver, BackingStoreSpec};
use rootbox::sync::{Phase, SyncChannel};
use rootbox::types::RootboxError;

use std::thread;

#[test]
fn test_start_attempt_provisions_storage_between_checkpoints() {
    let tmp = tempfile::tempdir().unwrap();
    let dest = tmp.path().join("box/rootfs");

    let (sup_end, child_end) = SyncChannel::establish().unwrap().split();
    let mut sup = StartupSequencer::new(Role::Supervisor, sup_end);
    let mut child = StartupSequencer::new(Role::Child, child_end);

    let dest_for_child = dest.clone();
    let child_side = thread::spawn(move || {
        let drivers = default_drivers();

        child.run_phase(Phase::Startup, || Ok(()))?;
        child.run_phase(Phase::PostConfigure, || {
            let source = format!("dir:{}", dest_for_child.display());
            let driver = find_driver(&drivers, &source)
                .ok_or_else(|| RootboxError::Storage("no backend for source".to_string()))?;
            let descriptor = driver.create(&dest_for_child, &BackingStoreSpec::default())?;
            assert_eq!(descriptor.src, source);
            Ok(())
        })?;
        child.run_phase(Phase::IdmappedMounts, || Ok(()))?;
        child.announce(Phase::ReadyStart)?;
        Ok::<(), RootboxError>(())
    });

    sup.await_phase(Phase::Startup).unwrap();
    sup.run_phase(Phase::Configure, || Ok(())).unwrap();
    sup.run_phase(Phase::CgroupLimits, || Ok(())).unwrap();
    sup.run_phase(Phase::Fds, || Ok(())).unwrap();

    child_side.join().unwrap().unwrap();
    assert!(dest.is_dir(), "child phase must have provisioned the store");
}

#[test]
fn test_supervisor_failure_unblocks_the_child() {
    let (sup_end, child_end) = SyncChannel::establish().unwrap().split();
    let mut sup = StartupSequencer::new(Role::Supervisor, sup_end);
    let mut child = StartupSequencer::new(Role::Child, child_end);

    let child_side = thread::spawn(move || {
        child.run_phase(Phase::Startup, || Ok(()))
    });

    sup.await_phase(Phase::Startup).unwrap();
    let err = sup
        .run_phase(Phase::Configure, || {
            Err(RootboxError::Resource("cgroup setup failed".to_string()))
        })
        .unwrap_err();
    assert!(matches!(err, RootboxError::Resource(_)));

    // The child was blocked in its barrier waiting for the configure
    // acknowledgement; the sentinel resolves it to a remote failure
    // instead of leaving it stuck.
    match child_side.join().unwrap() {
        Err(RootboxError::RemoteFailure(seq)) => assert_eq!(seq, Phase::Configure.seq()),
        other => panic!("expected RemoteFailure, got {:?}", other),
    }
}
