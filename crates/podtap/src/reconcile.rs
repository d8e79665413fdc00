use crate::registry::Registry;
use crate::session::SessionState;
use crate::{artifacts, session, Config};
use k8s_openapi::api::core::v1::Pod;
use std::collections::HashSet;
use std::sync::Arc;

/// Pod annotation whose presence requests a capture. Its value is the capture
/// duration in seconds, or the rotated file count in rotation mode; absence
/// is the stop signal.
pub const CAPTURE_ANNOTATION: &str = "podtap.dev/capture";

/// Reconciler maps pod lifecycle events onto capture session actions.
///
/// Failures while handling one pod are logged and never propagate: they must
/// not stall the event stream or disturb other sessions. Stops run on spawned
/// tasks for the same reason, as a slow-terminating capture must not block
/// ingestion.
pub struct Reconciler {
    registry: Arc<Registry>,
    config: Arc<Config>,
}

impl Reconciler {
    pub fn new(registry: Arc<Registry>, config: Arc<Config>) -> Self {
        Self { registry, config }
    }

    /// Handle an Added or Modified event, or one pod of a re-list.
    pub fn apply(&self, pod: &Pod) {
        let Some((pod_uid, pod_name)) = self.identity(pod) else {
            return;
        };
        let annotation = pod
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(CAPTURE_ANNOTATION));

        match (annotation, self.registry.get(pod_uid)) {
            (Some(requested), None) => self.start(pod_uid, pod_name, requested),
            // Already capturing. Annotation value changes are not re-applied;
            // a new capture requires removing and re-adding the annotation.
            (Some(_), Some(session)) if session.state() == SessionState::Running => (),
            // The found session is tearing down, so this is a re-add racing
            // the teardown of its predecessor. Record it on the session to be
            // honored once the teardown completes, or start directly if the
            // session is already gone from the registry.
            (Some(requested), Some(session)) => {
                if self.registry.request_restart(&session, requested) {
                    tracing::info!(pod = %pod_name, "capture re-requested while stopping, restart pending");
                } else {
                    self.start(pod_uid, pod_name, requested);
                }
            }
            (None, Some(session)) => self.stop_and_discard(&session),
            (None, None) => {
                // No session, but files may linger from a run before a crash.
                let removed = artifacts::remove_all(&self.config.output_dir, pod_name);
                if removed != 0 {
                    tracing::info!(pod = %pod_name, files = removed, "removed orphaned capture artifacts");
                }
            }
        }
    }

    /// Handle a Deleted event. A deleted pod cannot be observed again, so
    /// neither its capture nor its files may linger.
    pub fn delete(&self, pod: &Pod) {
        let Some((pod_uid, pod_name)) = self.identity(pod) else {
            return;
        };

        match self.registry.get(pod_uid) {
            Some(session) => self.stop_and_discard(&session),
            None => {
                let removed = artifacts::remove_all(&self.config.output_dir, pod_name);
                if removed != 0 {
                    tracing::info!(pod = %pod_name, files = removed, "removed capture artifacts of deleted pod");
                }
            }
        }
    }

    /// Handle a watch re-list: apply every listed pod, then prune sessions
    /// whose pods are absent from the list. The fresh list is authoritative,
    /// so a registered session without a listed pod means the pod was deleted
    /// while the stream was down, and it receives Delete semantics.
    pub fn resync(&self, pods: &[Pod]) {
        let mut live: HashSet<&str> = HashSet::new();

        for pod in pods {
            if let Some((pod_uid, _)) = self.identity(pod) {
                live.insert(pod_uid);
            }
            self.apply(pod);
        }

        for session in self.registry.snapshot() {
            if !live.contains(session.pod_uid.as_str()) {
                tracing::info!(pod = %session.pod_name, "pod vanished during watch outage");
                self.stop_and_discard(&session);
            }
        }
    }

    /// Pod UID and name, or None when the pod is not ours to handle.
    fn identity<'p>(&self, pod: &'p Pod) -> Option<(&'p str, &'p str)> {
        let node = pod.spec.as_ref().and_then(|spec| spec.node_name.as_deref());
        if node != Some(self.config.node_name.as_str()) {
            return None;
        }
        Some((pod.metadata.uid.as_deref()?, pod.metadata.name.as_deref()?))
    }

    /// Start a capture session, logging rather than propagating failures.
    fn start(&self, pod_uid: &str, pod_name: &str, requested: &str) {
        match session::start(&self.registry, &self.config, pod_uid, pod_name, requested) {
            Ok(_session) => (),
            Err(session::StartError::AlreadyActive) => {
                // Lost a start race; the existing session stands.
            }
            Err(error) => {
                tracing::error!(pod = %pod_name, ?error, "failed to start capture");
            }
        }
    }

    /// Begin an explicit stop which also discards artifact files.
    /// The termination sequence runs on its own task.
    fn stop_and_discard(&self, session: &Arc<session::Session>) {
        if !session.begin_stop() {
            // Another path is already tearing it down, and the latest word on
            // this pod carries no capture request: drop any pending restart.
            session.clear_restart();
            return;
        }
        let session = session.clone();
        let registry = self.registry.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            session::terminate(&session, true, &registry, &config).await;
        });
    }
}

#[cfg(test)]
mod test {
    use super::{Reconciler, CAPTURE_ANNOTATION};
    use crate::registry::Registry;
    use crate::Config;
    use k8s_openapi::api::core::v1::{Pod, PodSpec};
    use std::sync::Arc;

    fn annotated_pod(node: &str) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.uid = Some("uid-1".to_string());
        pod.metadata.name = Some("web-0".to_string());
        pod.metadata.annotations = Some(
            [(CAPTURE_ANNOTATION.to_string(), "5".to_string())]
                .into_iter()
                .collect(),
        );
        pod.spec = Some(PodSpec {
            node_name: Some(node.to_string()),
            ..Default::default()
        });
        pod
    }

    #[tokio::test]
    async fn ignores_pods_of_other_nodes() {
        let registry = Arc::new(Registry::new());
        let config = Arc::new(Config {
            node_name: "node-a".to_string(),
            output_dir: "/outputs".into(),
            capture_command: "tcpdump".to_string(),
            interface: "any".to_string(),
            default_duration: std::time::Duration::from_secs(10),
            grace_timeout: std::time::Duration::from_secs(15),
            delete_on_expiry: false,
            rotate_file_size: None,
            watch_backoff_max: std::time::Duration::from_secs(300),
        });
        let reconciler = Reconciler::new(registry.clone(), config);

        reconciler.apply(&annotated_pod("node-b"));
        assert!(registry.is_empty());

        reconciler.delete(&annotated_pod("node-b"));
        assert!(registry.is_empty());
    }
}
