//! How should we connect to the Kubernetes API server?

use backoff::ExponentialBackoff;
use std::future::Future;
use thiserror::Error as ThisError;

use crate::prelude::*;

/// An error which retrying won't fix, like `403 Forbidden` or a response we
/// can't parse.
#[derive(Debug, ThisError)]
#[error(transparent)]
pub struct PermanentError(#[from] Error);

/// Mark `err` as not worth retrying.
pub fn permanent(err: Error) -> Error {
    PermanentError(err).into()
}

/// Was `err`, or anything it wraps, marked with [`permanent`]?
fn is_permanent(err: &Error) -> bool {
    err.chain().any(|cause| cause.is::<PermanentError>())
}

/// How should we connect to the Kubernetes API server?
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectVia {
    /// Assume we're running on a workstation, with a kubeconfig file that
    /// `kubectl` knows how to find.
    Kubeconfig,
    /// Assume we're running in a pod, using its service account.
    Cluster,
}

impl ConnectVia {
    /// Should we retry failed requests?
    pub fn should_retry_by_default(self) -> bool {
        match self {
            // A person is waiting at a terminal, so it's better to pass
            // errors straight through immediately.
            ConnectVia::Kubeconfig => false,
            // Cluster DNS and API server restarts are flaky enough that
            // in-cluster callers should ride them out.
            ConnectVia::Cluster => true,
        }
    }

    /// Run the async function `f`. If `self.should_retry_by_default()` is
    /// true, retry failures using exponential backoff, except for those
    /// marked with [`permanent`]. Return either the result or the final
    /// failure.
    pub async fn retry_if_appropriate<F, Fut, T>(self, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.should_retry_by_default() {
            return f().await;
        }

        backoff::future::retry(ExponentialBackoff::default(), || {
            let attempt = f();
            async move {
                attempt.await.map_err(|err| {
                    if is_permanent(&err) {
                        backoff::Error::permanent(err)
                    } else {
                        debug!("retrying after error: {:#}", err);
                        backoff::Error::transient(err)
                    }
                })
            }
        })
        .await
    }
}

#[tokio::test]
async fn kubeconfig_does_not_retry() {
    let mut calls = 0;
    let result: Result<()> = ConnectVia::Kubeconfig
        .retry_if_appropriate(|| {
            calls += 1;
            async { Err(format_err!("connection refused")) }
        })
        .await;
    assert!(result.is_err());
    assert_eq!(calls, 1);
}

#[tokio::test]
async fn cluster_retries_until_success() {
    let mut calls = 0;
    let result = ConnectVia::Cluster
        .retry_if_appropriate(|| {
            calls += 1;
            let succeed = calls >= 3;
            async move {
                if succeed {
                    Ok(calls)
                } else {
                    Err(format_err!("connection refused"))
                }
            }
        })
        .await
        .expect("should eventually succeed");
    assert_eq!(result, 3);
}

#[tokio::test]
async fn cluster_gives_up_on_permanent_errors() {
    let mut calls = 0;
    let result: Result<()> = ConnectVia::Cluster
        .retry_if_appropriate(|| {
            calls += 1;
            async {
                Err::<(), _>(permanent(format_err!("forbidden")))
                    .context("could not fetch service")
            }
        })
        .await;
    let err = result.expect_err("permanent errors should be returned");
    assert_eq!(calls, 1);
    assert!(format!("{:#}", err).contains("forbidden"));
}
