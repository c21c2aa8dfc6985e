//! Cancellable per-call execution context
//!
//! Every handler invocation receives a [`CallContext`] carrying the request id
//! the client generated and a cancellation token. Cancellation is cooperative:
//! a handler only stops at the points where it checks its context.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{errors::RpcError, rpc::envelope::RequestId};

#[derive(Debug, Clone)]
pub struct CallContext {
    request_id: RequestId,
    method: Arc<str>,
    token: CancellationToken,
}

impl CallContext {
    pub(crate) fn new(request_id: RequestId, method: &str, token: CancellationToken) -> Self {
        Self {
            request_id,
            method: Arc::from(method),
            token,
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the call has been cancelled, locally or remotely.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Returns [`RpcError::Canceled`] once the call has been cancelled.
    pub fn check(&self) -> Result<(), RpcError> {
        if self.token.is_cancelled() {
            Err(RpcError::Canceled)
        } else {
            Ok(())
        }
    }

    /// The underlying token, for deriving child tokens in nested work.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Request id attached by the server loop to the context of a handler.
pub fn context_id(ctx: &CallContext) -> &RequestId {
    ctx.request_id()
}
