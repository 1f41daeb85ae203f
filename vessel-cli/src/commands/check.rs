use std::path::Path;
use vessel_cgroup::CgroupVersion;
use vessel_namespace::{HostCapabilities, NamespaceInfo};
use vessel_runtime::RuntimeConfig;

/// Namespace types an isolated launch relies on
const NAMESPACES: [&str; 5] = ["pid", "mnt", "uts", "ipc", "net"];

/// Print what this host supports; never fails
pub fn execute(config: &RuntimeConfig) {
    println!("\n🏥 Vessel Host Check\n");
    println!("{:-<60}", "");

    check_cgroup(&config.cgroup_root);
    let caps = HostCapabilities::probe();
    check_permissions(&caps);
    check_namespaces();
    check_binaries(&caps);

    println!("{:-<60}", "");
    if caps.supports_isolation() {
        println!("\n✅ Isolation available: containers run in namespaces\n");
    } else {
        println!("\n⚠️  Isolation unavailable: containers run in simulation mode\n");
    }
}

fn check_cgroup(root: &Path) {
    print!("Checking cgroup hierarchy... ");
    match CgroupVersion::detect(root) {
        Some(version) => {
            let controllers = std::fs::read_to_string(root.join("cgroup.controllers"))
                .map(|c| format!(" ({})", c.trim()))
                .unwrap_or_default();
            println!("✅ {version}{controllers}");
        }
        None => println!("⚠️  NOT FOUND at {} (no resource limits)", root.display()),
    }
}

fn check_permissions(caps: &HostCapabilities) {
    print!("Checking permissions... ");
    if caps.root {
        println!("✅ OK (root)");
    } else {
        println!("⚠️  NOT ROOT (namespaces and cgroups need root)");
    }
}

fn check_namespaces() {
    print!("Checking namespace support... ");
    match NamespaceInfo::current() {
        Ok(info) => {
            let missing: Vec<&str> = NAMESPACES
                .into_iter()
                .filter(|kind| info.get(kind).is_none())
                .collect();
            if missing.is_empty() {
                println!("✅ OK ({})", NAMESPACES.join(", "));
            } else {
                println!("⚠️  MISSING: {}", missing.join(", "));
            }
        }
        Err(e) => println!("❌ UNAVAILABLE ({e})"),
    }
}

fn check_binaries(caps: &HostCapabilities) {
    print!("Checking required binaries... ");
    let missing = caps.missing_binaries();
    if missing.is_empty() {
        println!("✅ OK (unshare, chroot, nsenter, ip)");
    } else {
        println!("⚠️  MISSING: {}", missing.join(", "));
    }
}
