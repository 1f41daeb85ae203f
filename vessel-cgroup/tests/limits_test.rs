//! Runs against the host hierarchy; skipped unless root with a cgroup mount

use vessel_cgroup::{CGROUP_ROOT, CGroupController, ResourceBackend, ResourceLimits};
use vessel_core::{CpuPercent, MemorySize};

fn is_root() -> bool {
    unsafe { libc::getuid() == 0 }
}

#[tokio::test]
async fn test_host_cgroup_roundtrip() {
    if !is_root() {
        println!("Skipping test (need root)");
        return;
    }

    let controller = match CGroupController::detect(CGROUP_ROOT) {
        Ok(c) => c,
        Err(e) => {
            println!("Skipping test: {e}");
            return;
        }
    };

    let limits = ResourceLimits::new(MemorySize::from_mb(64), CpuPercent::new(25.0));
    let handle = match controller.setup("limits-test", &limits).await {
        Ok(Some(h)) => h,
        Ok(None) => return,
        Err(e) => {
            println!("Skipping test (cgroup not writable): {e}");
            return;
        }
    };

    let outcome = controller.teardown(&handle).await;
    assert!(!outcome.is_failed(), "{outcome:?}");
}
