//! Method registration and lookup
//!
//! Handlers have the fixed shape `(CallContext, Input) -> Result<Output, RpcError>`.
//! A [`Service`] collects named handlers; [`DispatchTable::install`] validates a
//! whole service before any of its methods become callable.

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    marker::PhantomData,
    sync::Arc,
};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::{
    context::CallContext,
    errors::{RegistrationError, RpcError},
};

/// A callable method bound into the dispatch table.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn call(&self, ctx: CallContext, params: Value) -> Result<Value, RpcError>;

    /// Non-cancellable handlers never get a registry entry.
    fn is_cancellable(&self) -> bool {
        true
    }
}

struct FnHandler<F, I, O> {
    f: F,
    _signature: PhantomData<fn(I) -> O>,
}

#[async_trait]
impl<F, Fut, I, O> Handler for FnHandler<F, I, O>
where
    F: Fn(CallContext, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, RpcError>> + Send + 'static,
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
{
    async fn call(&self, ctx: CallContext, params: Value) -> Result<Value, RpcError> {
        let input: I =
            serde_json::from_value(params).map_err(|err| RpcError::invalid_params(err.to_string()))?;
        let output = (self.f)(ctx, input).await?;
        serde_json::to_value(output)
            .map_err(|err| RpcError::internal(format!("failed to encode result: {err}")))
    }
}

/// The methods of one service, keyed by bare method name.
#[derive(Default)]
pub struct Service {
    methods: Vec<(String, Arc<dyn Handler>)>,
}

impl Service {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method<F, Fut, I, O>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(CallContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, RpcError>> + Send + 'static,
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
    {
        self.handler(
            name,
            FnHandler {
                f,
                _signature: PhantomData,
            },
        )
    }

    pub fn handler(mut self, name: impl Into<String>, handler: impl Handler) -> Self {
        let handler: Arc<dyn Handler> = Arc::new(handler);
        self.methods.push((name.into(), handler));
        self
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// Immutable-after-construction mapping from `"Service.Method"` to handler.
#[derive(Default, Clone)]
pub struct DispatchTable {
    services: HashSet<String>,
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&mut self, service_name: &str, service: Service) -> Result<(), RegistrationError> {
        if !is_valid_name(service_name) {
            return Err(RegistrationError::InvalidServiceName {
                name: service_name.to_string(),
            });
        }
        if self.services.contains(service_name) {
            return Err(RegistrationError::DuplicateService {
                service: service_name.to_string(),
            });
        }
        if service.is_empty() {
            return Err(RegistrationError::NoMethods {
                service: service_name.to_string(),
            });
        }

        let mut staged: HashMap<String, Arc<dyn Handler>> = HashMap::with_capacity(service.len());
        for (method, handler) in service.methods {
            if !is_valid_name(&method) {
                return Err(RegistrationError::InvalidMethodName {
                    service: service_name.to_string(),
                    name: method,
                });
            }
            let full_name = format!("{service_name}.{method}");
            if staged.contains_key(&full_name) || self.handlers.contains_key(&full_name) {
                return Err(RegistrationError::DuplicateMethod { method: full_name });
            }
            staged.insert(full_name, handler);
        }

        self.services.insert(service_name.to_string());
        self.handlers.extend(staged);
        Ok(())
    }

    pub(crate) fn install_builtin(&mut self, service_name: &str, method: &str, handler: Arc<dyn Handler>) {
        self.services.insert(service_name.to_string());
        self.handlers.insert(format!("{service_name}.{method}"), handler);
    }

    pub fn lookup(&self, method: &str) -> Option<&Arc<dyn Handler>> {
        self.handlers.get(method)
    }

    pub fn has_service(&self, service_name: &str) -> bool {
        self.services.contains(service_name)
    }

    /// Registered `"Service.Method"` names in sorted order.
    pub fn methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('.') && !name.chars().any(char::is_whitespace)
}
