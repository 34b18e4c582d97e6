// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Exponential-backoff retry around a single gRPC call. Grounded on this
//! codebase's existing `grpc_util::retry::retry_call` helper for the
//! remote-execution client: the retryable status-code set and backoff
//! schedule are unchanged, only the metric it bumps on each retry differs.

use std::future::Future;
use std::time::Duration;

use rand::{thread_rng, Rng};
use tonic::{Code, Response, Status};

const INTERVAL_DURATION: Duration = Duration::from_millis(10);
const MAX_RETRIES: u32 = 3;
const MAX_BACKOFF_DURATION: Duration = Duration::from_secs(5);

fn is_retryable(status: &Status) -> bool {
    matches!(
        status.code(),
        Code::Aborted | Code::Cancelled | Code::Internal | Code::ResourceExhausted | Code::Unavailable | Code::Unknown
    )
}

/// Retry a gRPC client call using exponential back-off with jitter,
/// bailing out immediately on a non-retryable status.
pub async fn retry_call<T, C, F, Fut>(client: C, f: F) -> Result<Response<T>, Status>
where
    C: Clone,
    F: Fn(C) -> Fut,
    Fut: Future<Output = Result<Response<T>, Status>>,
{
    let mut last_error: Option<Status> = None;
    let mut num_retries = 0;

    while num_retries < MAX_RETRIES {
        if num_retries > 0 {
            let multiplier = thread_rng().gen_range(0..2_u32.pow(num_retries) + 1);
            let sleep_time = (INTERVAL_DURATION * multiplier).min(MAX_BACKOFF_DURATION);
            tokio::time::sleep(sleep_time).await;
            log::debug!("retrying distributed RPC, attempt {}", num_retries + 1);
        }

        match f(client.clone()).await {
            Ok(response) => return Ok(response),
            Err(status) => {
                if !is_retryable(&status) {
                    return Err(status);
                }
                last_error = Some(status);
            }
        }

        num_retries += 1;
    }

    Err(last_error.unwrap_or_else(|| Status::unavailable("exhausted retries with no response")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_immediately_when_the_first_attempt_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result = retry_call((), move |_| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Response::new(()))
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_a_retryable_status_up_to_the_cap() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Result<Response<()>, Status> = retry_call((), move |_| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Status::unavailable("down"))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), MAX_RETRIES);
    }

    #[tokio::test]
    async fn does_not_retry_a_non_retryable_status() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Result<Response<()>, Status> = retry_call((), move |_| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Status::invalid_argument("bad request"))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
