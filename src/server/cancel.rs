//! Remote cancellation endpoint
//!
//! Exposes the registry's `cancel` as the reserved `RpcCancel.Cancel` method.
//! The handler is a pure lookup-and-trigger: it never waits on the call it
//! cancels and is itself exempt from cancellation.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    context::CallContext, errors::RpcError, rpc::envelope::RequestId,
    server::registry::CancelRegistry,
};

use super::dispatch::Handler;

pub const CANCEL_SERVICE: &str = "RpcCancel";
pub const CANCEL_METHOD: &str = "RpcCancel.Cancel";

#[derive(Debug, Clone)]
pub struct CancelService {
    registry: Arc<CancelRegistry>,
}

impl CancelService {
    pub fn new(registry: Arc<CancelRegistry>) -> Self {
        Self { registry }
    }

    pub fn cancel(&self, request_id: &RequestId) -> String {
        self.registry.cancel(request_id)
    }
}

#[async_trait]
impl Handler for CancelService {
    async fn call(&self, _ctx: CallContext, params: Value) -> Result<Value, RpcError> {
        let request_id: RequestId =
            serde_json::from_value(params).map_err(|err| RpcError::invalid_params(err.to_string()))?;
        Ok(Value::String(self.cancel(&request_id)))
    }

    fn is_cancellable(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use super::*;

    fn ctx() -> CallContext {
        CallContext::new(RequestId::from("cancel-call"), CANCEL_METHOD, CancellationToken::new())
    }

    #[tokio::test]
    async fn forwards_to_registry() {
        let registry = Arc::new(CancelRegistry::new());
        let target = CancellationToken::new();
        registry.register(RequestId::from("slow-1"), target.clone());
        let service = CancelService::new(Arc::clone(&registry));

        let output = service.call(ctx(), json!("slow-1")).await.expect("cancel");

        assert_eq!(output, json!("request slow-1 canceled"));
        assert!(target.is_cancelled());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn unknown_request_returns_empty_message() {
        let service = CancelService::new(Arc::new(CancelRegistry::new()));

        let output = service.call(ctx(), json!("gone")).await.expect("cancel");

        assert_eq!(output, json!(""));
        assert!(!service.is_cancellable());
    }

    #[tokio::test]
    async fn non_string_id_is_invalid_params() {
        let service = CancelService::new(Arc::new(CancelRegistry::new()));

        let err = service.call(ctx(), json!(42)).await.expect_err("bad id");
        assert!(matches!(err, RpcError::InvalidParams { .. }));
    }
}
