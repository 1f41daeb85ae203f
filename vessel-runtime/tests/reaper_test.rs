use std::process::Command;
use std::time::{Duration, Instant};
use vessel_core::ProcessId;
use vessel_runtime::sampler::ProcStat;
use vessel_runtime::{ChildRegistry, ZombieReaper};

fn wait_for_zombie(pid: ProcessId) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if ProcStat::read(pid).is_ok_and(|stat| stat.is_zombie()) {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("process {pid} never became a zombie");
}

#[test]
fn reaps_untracked_zombies_on_second_sighting() {
    let registry = ChildRegistry::default();
    let mut reaper = ZombieReaper::new(registry.clone());

    let orphan = Command::new("true").spawn().unwrap();
    let orphan_pid = ProcessId::from_raw(i32::try_from(orphan.id()).unwrap());
    let tracked = Command::new("true").spawn().unwrap();
    let tracked_pid = ProcessId::from_raw(i32::try_from(tracked.id()).unwrap());
    registry.track(tracked_pid);

    wait_for_zombie(orphan_pid);
    wait_for_zombie(tracked_pid);

    assert!(reaper.scan().is_empty(), "first sighting only records");
    let reaped = reaper.scan();
    assert_eq!(reaped, vec![(orphan_pid.as_raw(), 0)]);
    assert!(!orphan_pid.is_alive());

    assert!(ProcStat::read(tracked_pid).is_ok_and(|stat| stat.is_zombie()));
    registry.untrack(tracked_pid);
    drop(tracked);
    drop(orphan);
}
