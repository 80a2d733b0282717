//! Opens the demo archive as a real shared library through `DylibLoader`
//!
//! Cargo builds the `cdylib` next to the test binary when it builds this
//! package's library. If it is missing (a different runner layout) it is
//! built into a separate target directory so the outer build lock is not
//! contended.

use std::env::consts::{DLL_PREFIX, DLL_SUFFIX};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use sideload_demo::{CLOCK, GREETER, REPORTER};
use sideload_kernel::config::SideloadConfig;
use sideload_kernel::{HostRegistry, InMemoryRegistry, ModuleTypeId, Scope};
use sideload_loader::{ArchiveLoader, DependencyGraph, DylibLoader, SideloadManager, scan};
use tempfile::TempDir;

// ============================================================================
// Helper Functions
// ============================================================================

fn library_name() -> String {
    format!("{}sideload_demo{}", DLL_PREFIX, DLL_SUFFIX)
}

fn built_alongside() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    // target/<profile>/deps/<test binary>
    let deps = exe.parent()?;
    [deps, deps.parent()?]
        .into_iter()
        .map(|dir| dir.join(library_name()))
        .find(|candidate| candidate.is_file())
}

fn build_separately() -> PathBuf {
    let target_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/fixtures");
    let status = Command::new(env!("CARGO"))
        .args(["build", "-p", "sideload-demo", "--target-dir"])
        .arg(&target_dir)
        .status()
        .expect("failed to run cargo");
    assert!(status.success(), "building sideload-demo failed");
    target_dir.join("debug").join(library_name())
}

fn demo_library() -> PathBuf {
    let path = built_alongside().unwrap_or_else(build_separately);
    assert!(path.is_file(), "demo library missing at {:?}", path);
    path
}

fn id(s: &str) -> ModuleTypeId {
    ModuleTypeId::new(s)
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_open_registers_three_modules() {
    let library = demo_library();
    let opened = DylibLoader::new().open(&library).unwrap();

    assert_eq!(opened.candidates.len(), 3);
    assert_eq!(opened.handle.path(), library.as_path());
    let digest = opened.handle.digest().unwrap();
    assert_eq!(digest.len(), 64);
    assert_eq!(digest, DylibLoader::calculate_hash(&library).unwrap());

    let label = library.display().to_string();
    let sorted = DependencyGraph::build(scan(&label, opened.candidates))
        .topological_sort()
        .unwrap();
    let names: Vec<&str> = sorted.iter().map(|class| class.name()).collect();
    assert_eq!(names, vec!["Clock", "Greeter", "Reporter"]);
}

#[test]
fn test_open_rejects_a_file_that_is_not_a_library() {
    let dir = TempDir::new().unwrap();
    let bogus = dir.path().join(library_name());
    std::fs::write(&bogus, b"not a shared library").unwrap();

    assert!(DylibLoader::new().open(&bogus).is_err());
}

#[tokio::test]
async fn test_manager_loads_and_unloads_the_demo() {
    let dir = TempDir::new().unwrap();
    let archive = dir.path().join(library_name());
    std::fs::copy(demo_library(), &archive).unwrap();

    let registry = Arc::new(InMemoryRegistry::new());
    let config = SideloadConfig::default().with_plugin_dir(dir.path());
    let manager =
        SideloadManager::with_dylib_loader(config, registry.clone(), Scope::root()).unwrap();

    let loads = manager.load_initial().await.unwrap();
    assert_eq!(loads.len(), 1);
    let report = loads[0].result.as_ref().unwrap();
    assert!(report.is_complete());
    assert_eq!(report.loaded_names(), vec!["Clock", "Greeter", "Reporter"]);

    for type_id in [CLOCK, GREETER, REPORTER] {
        let instance = registry.find_by_type(&id(type_id)).unwrap();
        assert!(registry.is_running(&instance), "{} not running", type_id);
    }

    // Reporter's parent scope is composed from both of its dependencies
    let reporter = registry.find_by_type(&id(REPORTER)).unwrap();
    assert!(reporter.scope().module(&id(CLOCK)).is_some());
    assert!(reporter.scope().module(&id(GREETER)).is_some());

    drop(reporter);
    assert_eq!(manager.unload_archive(&archive).await.unwrap(), 3);
    assert!(registry.is_empty());

    manager.shutdown().await.unwrap();
}
