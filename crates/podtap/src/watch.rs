use crate::reconcile::Reconciler;
use anyhow::Context;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::runtime::watcher;
use kube::Api;

/// One-shot connectivity probe performed at startup, so that credential or
/// connectivity problems are fatal instead of an endless reconnect loop.
pub async fn probe(client: &kube::Client) -> anyhow::Result<()> {
    let pods: Api<Pod> = Api::all(client.clone());

    pods.list(&ListParams::default().limit(1))
        .await
        .context("failed to list pods from the cluster API")?;

    Ok(())
}

/// Consume the pod watch stream, feeding every event to the reconciler.
///
/// A failed or ended stream is re-established after an exponential backoff,
/// resuming from a fresh list; the backoff resets on any delivered event.
/// Registry state lives outside this loop and survives reconnects. This
/// future does not resolve.
pub async fn serve(client: kube::Client, reconciler: Reconciler, backoff_max: std::time::Duration) {
    let pods: Api<Pod> = Api::all(client);
    let backoff = exponential_backoff::Backoff::new(
        u32::MAX,
        std::time::Duration::from_millis(250),
        Some(backoff_max),
    );
    let mut attempt = 0u32;

    loop {
        let mut stream = Box::pin(watcher::watcher(pods.clone(), watcher::Config::default()));

        loop {
            match stream.try_next().await {
                Ok(Some(watcher::Event::Applied(pod))) => reconciler.apply(&pod),
                Ok(Some(watcher::Event::Deleted(pod))) => reconciler.delete(&pod),
                Ok(Some(watcher::Event::Restarted(pods))) => {
                    tracing::info!(pods = pods.len(), "pod watch listed");
                    reconciler.resync(&pods);
                }
                Ok(None) => {
                    tracing::warn!("pod watch stream ended (will retry)");
                    break;
                }
                Err(error) => {
                    tracing::warn!(%error, "pod watch stream failed (will retry)");
                    break;
                }
            }
            attempt = 0;
        }

        attempt += 1;
        if let Some(pause) = backoff.next(attempt) {
            tokio::time::sleep(pause).await;
        }
    }
}
