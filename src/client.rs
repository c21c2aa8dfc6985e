//! Client side of the call multiplexer
//!
//! Outbound requests are queued to a writer task; a single reader task routes
//! responses back to the waiting calls by request id. A call abandoned through
//! its cancellation token or deadline asks the server to cancel it from a
//! detached task and returns without waiting for the answer.

use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::{mpsc, oneshot},
    time::Instant,
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};
use tracing::{debug, warn};

use crate::{
    config::Config,
    errors::RpcError,
    rpc::{
        codec::{CodecError, EnvelopeCodec},
        envelope::{Request, RequestId, Response},
    },
    server::cancel::CANCEL_METHOD,
};

struct PendingCall {
    method: String,
    response_tx: oneshot::Sender<Result<Value, RpcError>>,
}

#[derive(Default)]
struct PendingCalls {
    calls: HashMap<RequestId, PendingCall>,
    closed: bool,
}

#[derive(Default)]
struct Shared {
    pending: Mutex<PendingCalls>,
}

impl Shared {
    fn insert(&self, method: &str) -> Result<(RequestId, oneshot::Receiver<Result<Value, RpcError>>), RpcError> {
        let mut pending = self.pending.lock();
        if pending.closed {
            return Err(RpcError::ConnectionClosed);
        }

        let id = loop {
            let candidate = RequestId::generate();
            if !pending.calls.contains_key(&candidate) {
                break candidate;
            }
        };
        let (response_tx, response_rx) = oneshot::channel();
        pending.calls.insert(
            id.clone(),
            PendingCall {
                method: method.to_string(),
                response_tx,
            },
        );
        Ok((id, response_rx))
    }

    fn remove(&self, id: &RequestId) -> Option<PendingCall> {
        self.pending.lock().calls.remove(id)
    }

    fn resolve(&self, response: Response) {
        let Some(id) = response.id.clone() else {
            warn!(error = ?response.error, "server reported an error without a request id");
            return;
        };

        let Some(call) = self.remove(&id) else {
            debug!(request_id = %id, "discarding response for unknown request");
            return;
        };

        let outcome = response
            .into_outcome()
            .map_err(|error| RpcError::from_error_object(&call.method, error));
        // The caller may have given up between removal and delivery.
        let _ = call.response_tx.send(outcome);
    }

    /// Marks the connection closed and fails every pending call.
    fn close(&self) -> usize {
        let drained: Vec<PendingCall> = {
            let mut pending = self.pending.lock();
            pending.closed = true;
            pending.calls.drain().map(|(_, call)| call).collect()
        };

        let abandoned = drained.len();
        for call in drained {
            let _ = call.response_tx.send(Err(RpcError::ConnectionClosed));
        }
        abandoned
    }

    fn len(&self) -> usize {
        self.pending.lock().calls.len()
    }
}

/// Removes the pending record however the call ends, including when the
/// caller drops the call future.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.remove(&self.id);
    }
}

#[derive(Clone)]
pub struct Client {
    outbound: mpsc::Sender<Request>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    cancel_timeout: Duration,
}

impl Client {
    pub async fn dial(ctx: &CancellationToken, network: &str, address: &str) -> Result<Self, RpcError> {
        Self::dial_with_config(ctx, network, address, &Config::default()).await
    }

    /// Connects to `address` over `network` (`tcp`, `tcp4`, `tcp6`, or `unix`
    /// on unix platforms). `ctx` bounds the connection attempt only.
    pub async fn dial_with_config(
        ctx: &CancellationToken,
        network: &str,
        address: &str,
        config: &Config,
    ) -> Result<Self, RpcError> {
        match network {
            "tcp" | "tcp4" | "tcp6" => {
                let stream = tokio::select! {
                    _ = ctx.cancelled() => return Err(RpcError::Canceled),
                    connected = TcpStream::connect(address) => connected?,
                };
                stream.set_nodelay(true)?;
                debug!(network, address, "connected");
                Ok(Self::from_stream(stream, config))
            }
            #[cfg(unix)]
            "unix" => {
                let stream = tokio::select! {
                    _ = ctx.cancelled() => return Err(RpcError::Canceled),
                    connected = tokio::net::UnixStream::connect(address) => connected?,
                };
                debug!(network, address, "connected");
                Ok(Self::from_stream(stream, config))
            }
            other => Err(RpcError::transport(format!("unsupported network {other:?}"))),
        }
    }

    /// Runs the client over an already-established stream.
    pub fn from_stream<S>(stream: S, config: &Config) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let frames = FramedRead::new(read_half, EnvelopeCodec::<Response, Request>::new(config.max_frame_bytes));
        let sink = FramedWrite::new(write_half, EnvelopeCodec::<Response, Request>::new(config.max_frame_bytes));
        let (outbound, outbound_rx) = mpsc::channel(config.outbound_queue);
        let shared = Arc::new(Shared::default());
        let shutdown = CancellationToken::new();

        tokio::spawn(write_requests(sink, outbound_rx, Arc::clone(&shared), shutdown.clone()));
        tokio::spawn(read_responses(frames, Arc::clone(&shared), shutdown.clone()));

        Self {
            outbound,
            shared,
            shutdown,
            cancel_timeout: config.cancel_timeout,
        }
    }

    /// Calls `method` and waits until its response arrives, the connection
    /// fails, or `ctx` is cancelled.
    pub async fn call<I, O>(&self, ctx: &CancellationToken, method: &str, input: &I) -> Result<O, RpcError>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        self.call_with_deadline(ctx, None, method, input).await
    }

    /// Like [`Client::call`], additionally giving up after `timeout`.
    pub async fn call_timeout<I, O>(
        &self,
        ctx: &CancellationToken,
        timeout: Duration,
        method: &str,
        input: &I,
    ) -> Result<O, RpcError>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        self.call_with_deadline(ctx, Some(Instant::now() + timeout), method, input)
            .await
    }

    async fn call_with_deadline<I, O>(
        &self,
        ctx: &CancellationToken,
        deadline: Option<Instant>,
        method: &str,
        input: &I,
    ) -> Result<O, RpcError>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        let params = serde_json::to_value(input)
            .map_err(|err| RpcError::invalid_params(format!("failed to encode params: {err}")))?;
        let result = self.invoke(ctx, deadline, method, params).await?;
        serde_json::from_value(result)
            .map_err(|err| RpcError::internal(format!("failed to decode result: {err}")))
    }

    async fn invoke(
        &self,
        ctx: &CancellationToken,
        deadline: Option<Instant>,
        method: &str,
        params: Value,
    ) -> Result<Value, RpcError> {
        if ctx.is_cancelled() {
            return Err(RpcError::Canceled);
        }

        let (id, response_rx) = self.shared.insert(method)?;
        let _guard = PendingGuard {
            shared: &self.shared,
            id: id.clone(),
        };

        // Nothing has reached the server if we give up while still queued.
        tokio::select! {
            biased;
            sent = self.outbound.send(Request::new(id.clone(), method, params)) => {
                if sent.is_err() {
                    return Err(RpcError::ConnectionClosed);
                }
            }
            _ = ctx.cancelled() => return Err(RpcError::Canceled),
            _ = deadline_elapsed(deadline) => return Err(RpcError::DeadlineExceeded),
        }

        tokio::select! {
            biased;
            response = response_rx => response.unwrap_or(Err(RpcError::ConnectionClosed)),
            _ = ctx.cancelled() => {
                self.cancel_remote(method, id);
                Err(RpcError::Canceled)
            }
            _ = deadline_elapsed(deadline) => {
                self.cancel_remote(method, id);
                Err(RpcError::DeadlineExceeded)
            }
        }
    }

    /// Asks the server to cancel `id` without waiting for the outcome.
    fn cancel_remote(&self, method: &str, id: RequestId) {
        if method == CANCEL_METHOD {
            return;
        }

        let client = self.clone();
        tokio::spawn(async move {
            let ctx = CancellationToken::new();
            let result: Result<String, RpcError> = client
                .call_timeout(&ctx, client.cancel_timeout, CANCEL_METHOD, &id)
                .await;
            match result {
                Ok(message) if message.is_empty() => {
                    debug!(request_id = %id, "remote call had already finished")
                }
                Ok(message) => debug!(request_id = %id, message = %message, "remote call canceled"),
                Err(err) => warn!(request_id = %id, error = %err, "failed to cancel remote call"),
            }
        });
    }

    /// Shuts the connection down; pending calls fail with
    /// [`RpcError::ConnectionClosed`].
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Number of calls still awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.shared.len()
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn write_requests<W>(
    mut sink: FramedWrite<W, EnvelopeCodec<Response, Request>>,
    mut outbound_rx: mpsc::Receiver<Request>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let request = tokio::select! {
            _ = shutdown.cancelled() => break,
            request = outbound_rx.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let id = request.id.clone();
        match sink.send(request).await {
            Ok(()) => {}
            Err(CodecError::Io(err)) => {
                warn!(error = %err, "connection write failed");
                shutdown.cancel();
                break;
            }
            Err(err) => {
                if let Some(call) = shared.remove(&id) {
                    let _ = call
                        .response_tx
                        .send(Err(RpcError::invalid_params(err.to_string())));
                }
            }
        }
    }

    if let Err(err) = sink.close().await {
        debug!(error = %err, "failed to close connection writer");
    }
}

async fn read_responses<R>(
    mut frames: FramedRead<R, EnvelopeCodec<Response, Request>>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = frames.next() => frame,
        };

        match frame {
            None => {
                debug!("server closed connection");
                break;
            }
            Some(Err(err)) => {
                warn!(error = %err, "connection read failed");
                break;
            }
            Some(Ok(Err(err))) => warn!(error = %err, "discarding malformed response"),
            Some(Ok(Ok(response))) => shared.resolve(response),
        }
    }

    shutdown.cancel();
    let abandoned = shared.close();
    if abandoned > 0 {
        debug!(abandoned_calls = abandoned, "failed pending calls after connection closed");
    }
}
