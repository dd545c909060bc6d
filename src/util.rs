use std::{future::Future, time::Duration};

use backoff::ExponentialBackoff;

/// Timeout applied to single Kubernetes API calls.
pub const KUBE_CALL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("Kubernetes error: {0}")]
    Kubernetes(#[source] kube::Error),
    #[error("Kubernetes call timed out after {0:?}")]
    Timeout(Duration),
}

/// Runs a Kubernetes API call bounded by [`KUBE_CALL_TIMEOUT`].
pub async fn with_timeout<T, F>(call: F) -> Result<T, CallError>
where
    F: Future<Output = Result<T, kube::Error>>,
{
    match tokio::time::timeout(KUBE_CALL_TIMEOUT, call).await {
        Ok(res) => res.map_err(CallError::Kubernetes),
        Err(_) => Err(CallError::Timeout(KUBE_CALL_TIMEOUT)),
    }
}

/// Tells whether the API server serves `kind` under `group_version` (e.g. `networking.k8s.io/v1beta1`).
pub async fn is_api_served(
    kube_client: &kube::Client,
    group_version: &str,
    kind: &str,
) -> Result<bool, kube::Error> {
    let resources = match kube_client.list_api_group_resources(group_version).await {
        Ok(resources) => resources,
        Err(kube::Error::Api(api_error)) if api_error.code == 404 => return Ok(false),
        Err(error) => return Err(error),
    };

    Ok(resources.resources.iter().any(|r| r.kind == kind))
}

/// Backoff applied to watch streams after an error. Never gives up.
pub fn watch_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        max_interval: Duration::from_secs(60),
        max_elapsed_time: None,
        ..Default::default()
    }
}

/// Tells whether the error is a Kubernetes "not found" response.
pub fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(api_error) if api_error.code == 404)
}
