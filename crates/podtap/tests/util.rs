#![allow(dead_code)] // Not every fixture is used by every test binary.

use k8s_openapi::api::core::v1::{Pod, PodSpec};
use podtap::reconcile::CAPTURE_ANNOTATION;
use podtap::{Config, Reconciler, Registry};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const NODE: &str = "test-node";

/// Everything a lifecycle test needs: a scratch output directory holding the
/// fake capture tool, the session registry, and a reconciler bound to NODE.
pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub registry: Arc<Registry>,
    pub config: Arc<Config>,
    pub reconciler: Reconciler,
}

/// Fixture whose capture tool writes its `-w` target (plus one rotated
/// sibling) and then idles until SIGTERM.
pub fn fixture() -> Fixture {
    build(IDLE_CAPTURE, None, false)
}

/// Fixture whose capture tool exits immediately after writing its file.
pub fn oneshot_fixture() -> Fixture {
    build(ONESHOT_CAPTURE, None, false)
}

/// Fixture running in rotation mode with the given file size.
pub fn rotating_fixture(rotate_file_size: u64) -> Fixture {
    build(IDLE_CAPTURE, Some(rotate_file_size), false)
}

/// Fixture whose sessions also delete their artifact files on expiry.
pub fn delete_on_expiry_fixture() -> Fixture {
    build(IDLE_CAPTURE, None, true)
}

fn build(tool: &str, rotate_file_size: Option<u64>, delete_on_expiry: bool) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let capture_command = install_tool(dir.path(), tool);

    let config = Arc::new(Config {
        node_name: NODE.to_string(),
        output_dir: dir.path().to_path_buf(),
        capture_command,
        interface: "any".to_string(),
        // Sub-second precision, which the duration fallback must preserve.
        default_duration: std::time::Duration::from_millis(2500),
        grace_timeout: std::time::Duration::from_secs(5),
        delete_on_expiry,
        rotate_file_size,
        watch_backoff_max: std::time::Duration::from_secs(1),
    });
    let registry = Arc::new(Registry::new());
    let reconciler = Reconciler::new(registry.clone(), config.clone());

    Fixture {
        dir,
        registry,
        config,
        reconciler,
    }
}

const IDLE_CAPTURE: &str = r#"#!/bin/sh
out=""
while [ $# -gt 0 ]; do
    if [ "$1" = "-w" ]; then out="$2"; fi
    shift
done
: > "$out"
: > "${out}1"
trap 'exit 0' TERM
while :; do sleep 1; done
"#;

const ONESHOT_CAPTURE: &str = r#"#!/bin/sh
out=""
while [ $# -gt 0 ]; do
    if [ "$1" = "-w" ]; then out="$2"; fi
    shift
done
: > "$out"
"#;

fn install_tool(dir: &Path, tool: &str) -> String {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-capture");
    std::fs::write(&path, tool).unwrap();

    let mut permissions = std::fs::metadata(&path).unwrap().permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&path, permissions).unwrap();

    path.display().to_string()
}

/// A pod scheduled to NODE, optionally annotated for capture.
pub fn pod(uid: &str, name: &str, annotation: Option<&str>) -> Pod {
    let mut pod = Pod::default();
    pod.metadata.uid = Some(uid.to_string());
    pod.metadata.name = Some(name.to_string());
    pod.metadata.annotations = annotation.map(|value| {
        [(CAPTURE_ANNOTATION.to_string(), value.to_string())]
            .into_iter()
            .collect()
    });
    pod.spec = Some(PodSpec {
        node_name: Some(NODE.to_string()),
        ..Default::default()
    });
    pod
}

/// Artifact path the capture tool writes for `pod_name`.
pub fn artifact(fixture: &Fixture, pod_name: &str) -> PathBuf {
    podtap::artifacts::capture_path(&fixture.config.output_dir, pod_name)
}

/// Wait for the capture tool to have written `path`.
pub async fn await_file(path: &Path) {
    for _ in 0..200 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
    panic!("{} was not written", path.display());
}

/// Await session teardown, bounded so a wedged test fails instead of hanging.
pub async fn await_done(session: &Arc<podtap::session::Session>) {
    tokio::time::timeout(std::time::Duration::from_secs(15), session.done())
        .await
        .expect("session did not terminate in time");
}
