use std::io;

use thiserror::Error;

use crate::rpc::envelope::{
    ErrorObject, APPLICATION_ERROR, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST,
    METHOD_NOT_FOUND, PARSE_ERROR, REQUEST_CANCELLED,
};

/// Outcome of a single call that did not produce a result.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    #[error("method not found: {method}")]
    MethodNotFound { method: String },
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("invalid params: {message}")]
    InvalidParams { message: String },
    #[error("{message}")]
    Application { message: String },
    #[error("call canceled")]
    Canceled,
    #[error("call deadline exceeded")]
    DeadlineExceeded,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("transport error: {message}")]
    Transport { message: String },
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl RpcError {
    pub fn application(message: impl Into<String>) -> Self {
        Self::Application {
            message: message.into(),
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport {
            message: err.to_string(),
        }
    }

    /// True for local cancellation, deadlines and remotely observed cancellation.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Canceled | Self::DeadlineExceeded)
    }

    /// True when the call failed because the connection is unusable.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::ConnectionClosed | Self::Transport { .. })
    }

    pub fn to_error_object(&self) -> ErrorObject {
        match self {
            Self::MethodNotFound { .. } => ErrorObject::new(METHOD_NOT_FOUND, self.to_string()),
            Self::InvalidRequest { message } => ErrorObject::new(INVALID_REQUEST, message.clone()),
            Self::InvalidParams { message } => ErrorObject::new(INVALID_PARAMS, message.clone()),
            Self::Application { message } => ErrorObject::new(APPLICATION_ERROR, message.clone()),
            Self::Canceled | Self::DeadlineExceeded => {
                ErrorObject::new(REQUEST_CANCELLED, self.to_string())
            }
            // Transport failures are local to whichever side observed them and never travel.
            Self::ConnectionClosed | Self::Transport { .. } | Self::Internal { .. } => {
                ErrorObject::new(INTERNAL_ERROR, self.to_string())
            }
        }
    }

    pub fn from_error_object(method: &str, error: ErrorObject) -> Self {
        match error.code {
            METHOD_NOT_FOUND => Self::MethodNotFound {
                method: method.to_string(),
            },
            PARSE_ERROR | INVALID_REQUEST => Self::InvalidRequest {
                message: error.message,
            },
            INVALID_PARAMS => Self::InvalidParams {
                message: error.message,
            },
            REQUEST_CANCELLED => Self::Canceled,
            APPLICATION_ERROR => Self::Application {
                message: error.message,
            },
            _ => Self::Internal {
                message: error.message,
            },
        }
    }
}

impl From<io::Error> for RpcError {
    fn from(err: io::Error) -> Self {
        Self::transport(err)
    }
}

/// Construction-time failures raised by `Server::register_name`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("invalid service name {name:?}: names must be non-empty and contain no '.' or whitespace")]
    InvalidServiceName { name: String },
    #[error("invalid method name {name:?} on service {service}")]
    InvalidMethodName { service: String, name: String },
    #[error("service {service} has no methods")]
    NoMethods { service: String },
    #[error("service {service} is already registered")]
    DuplicateService { service: String },
    #[error("method {method} is registered more than once")]
    DuplicateMethod { method: String },
    #[error("service name {service} is reserved")]
    ReservedService { service: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn application_errors_keep_their_message_verbatim() {
        let err = RpcError::application("disk on fire");
        let object = err.to_error_object();

        assert_eq!(object.code, APPLICATION_ERROR);
        assert_eq!(object.message, "disk on fire");
        assert_eq!(RpcError::from_error_object("Test.Test", object), err);
    }

    #[test]
    fn cancellation_maps_to_request_cancelled() {
        let object = RpcError::DeadlineExceeded.to_error_object();
        assert_eq!(object.code, REQUEST_CANCELLED);

        let err = RpcError::from_error_object("Test.Slow", object);
        assert_eq!(err, RpcError::Canceled);
        assert!(err.is_cancellation());
        assert!(!err.is_transport());
    }

    #[test]
    fn method_not_found_names_the_requested_method() {
        let object = ErrorObject::new(METHOD_NOT_FOUND, "whatever the server said");
        let err = RpcError::from_error_object("Foo.Bar", object);

        assert_eq!(
            err,
            RpcError::MethodNotFound {
                method: "Foo.Bar".to_string()
            }
        );
        assert_eq!(err.to_string(), "method not found: Foo.Bar");
    }

    #[test]
    fn unknown_codes_become_internal_errors() {
        let err = RpcError::from_error_object("Test.Test", ErrorObject::new(-1, "odd"));
        assert!(matches!(err, RpcError::Internal { message } if message == "odd"));
    }
}
