use std::time::Instant;

use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crate::{errors::RpcError, rpc::envelope::RequestId};

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

pub fn call_outcome<T>(result: &Result<T, RpcError>) -> &'static str {
    match result {
        Ok(_) => "success",
        Err(RpcError::Application { .. }) => "application_error",
        Err(err) if err.is_cancellation() => "canceled",
        Err(_) => "failure",
    }
}

/// Emits the per-call summary event for a completed server-side call.
pub fn log_call_summary<T>(
    method: &str,
    request_id: &RequestId,
    started_at: Instant,
    result: &Result<T, RpcError>,
) {
    let outcome = call_outcome(result);
    let elapsed_ms = started_at.elapsed().as_millis();

    info!(
        method = %method,
        request_id = %request_id,
        outcome,
        duration_ms = elapsed_ms,
        "call summary"
    );

    if let Err(err) = result {
        if !matches!(err, RpcError::Application { .. }) && !err.is_cancellation() {
            warn!(method = %method, request_id = %request_id, error = %err, "call failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_distinguish_error_classes() {
        assert_eq!(call_outcome(&Ok::<(), RpcError>(())), "success");
        assert_eq!(
            call_outcome::<()>(&Err(RpcError::application("boom"))),
            "application_error"
        );
        assert_eq!(call_outcome::<()>(&Err(RpcError::Canceled)), "canceled");
        assert_eq!(
            call_outcome::<()>(&Err(RpcError::MethodNotFound {
                method: "Foo.Bar".to_string()
            })),
            "failure"
        );
    }
}
