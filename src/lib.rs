pub mod client;
pub mod config;
pub mod context;
pub mod errors;
pub mod logging;
pub mod rpc;
pub mod server;

pub use client::Client;
pub use context::{context_id, CallContext};
pub use errors::{RegistrationError, RpcError};
pub use rpc::envelope::RequestId;
pub use server::{
    cancel::CANCEL_METHOD,
    dispatch::{Handler, Service},
    Server,
};
pub use tokio_util::sync::CancellationToken;
