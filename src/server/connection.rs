//! Per-connection read, dispatch and write loop
//!
//! The read loop never waits on a handler: every call runs in its own task and
//! hands its response to a dedicated writer task. When the read loop ends, the
//! connection token is cancelled and the connection's registry entries are swept.

use std::{panic::AssertUnwindSafe, sync::Arc, time::Instant};

use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};
use tracing::{debug, info, warn};

use crate::{
    context::CallContext,
    errors::RpcError,
    logging::log_call_summary,
    rpc::{
        codec::{CodecError, EnvelopeCodec},
        envelope::{Request, Response, INTERNAL_ERROR, PARSE_ERROR},
    },
    server::{
        dispatch::DispatchTable,
        registry::{CancelRegistry, ConnectionId},
    },
};

pub(crate) struct Connection {
    pub id: ConnectionId,
    pub peer: String,
    pub table: Arc<DispatchTable>,
    pub registry: Arc<CancelRegistry>,
    pub max_frame_bytes: usize,
    pub outbound_queue: usize,
}

impl Connection {
    pub async fn serve<S>(self, root: CancellationToken, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut frames = FramedRead::new(read_half, EnvelopeCodec::<Value, Response>::new(self.max_frame_bytes));
        let sink = FramedWrite::new(write_half, EnvelopeCodec::<Value, Response>::new(self.max_frame_bytes));
        let (responses_tx, responses_rx) = mpsc::channel(self.outbound_queue);
        tokio::spawn(write_responses(self.id, sink, responses_rx));

        let connection_token = root.child_token();
        debug!(connection = self.id, peer = %self.peer, "connection opened");

        loop {
            let frame = tokio::select! {
                _ = connection_token.cancelled() => break,
                frame = frames.next() => frame,
            };

            match frame {
                None => break,
                Some(Err(err)) => {
                    warn!(connection = self.id, peer = %self.peer, error = %err, "connection read failed");
                    break;
                }
                Some(Ok(Err(err))) => {
                    debug!(connection = self.id, error = %err, "received malformed envelope");
                    send_response(&responses_tx, Response::error(None, PARSE_ERROR, "Parse error")).await;
                }
                Some(Ok(Ok(payload))) => match Request::from_value(payload) {
                    Ok(request) => {
                        self.dispatch(request, &connection_token, &responses_tx).await;
                    }
                    Err(response) => send_response(&responses_tx, response).await,
                },
            }
        }

        connection_token.cancel();
        let swept = self.registry.sweep(self.id);
        debug!(
            connection = self.id,
            peer = %self.peer,
            abandoned_calls = swept,
            "connection closed"
        );
    }

    async fn dispatch(
        &self,
        request: Request,
        connection_token: &CancellationToken,
        responses_tx: &mpsc::Sender<Response>,
    ) {
        let Request {
            id, method, params, ..
        } = request;

        let Some(handler) = self.table.lookup(&method).cloned() else {
            let result: Result<(), RpcError> = Err(RpcError::MethodNotFound {
                method: method.clone(),
            });
            log_call_summary(&method, &id, Instant::now(), &result);
            let error = RpcError::MethodNotFound { method }.to_error_object();
            send_response(responses_tx, Response::from_error_object(Some(id), error)).await;
            return;
        };

        let token = connection_token.child_token();
        let cancellable = handler.is_cancellable();
        if cancellable {
            self.registry.register_for(self.id, id.clone(), token.clone());
        }

        let ctx = CallContext::new(id.clone(), &method, token);
        let registry = Arc::clone(&self.registry);
        let connection = self.id;
        let responses_tx = responses_tx.clone();

        tokio::spawn(async move {
            let started_at = Instant::now();
            let result = AssertUnwindSafe(handler.call(ctx, params))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(RpcError::internal("handler panicked")));

            if cancellable {
                registry.unregister_for(connection, &id);
            }
            log_call_summary(&method, &id, started_at, &result);

            let response = match result {
                Ok(value) => Response::result(id, value),
                Err(err) => Response::from_error_object(Some(id), err.to_error_object()),
            };
            send_response(&responses_tx, response).await;
        });
    }
}

async fn send_response(responses_tx: &mpsc::Sender<Response>, response: Response) {
    if responses_tx.send(response).await.is_err() {
        debug!("response dropped: connection writer has stopped");
    }
}

async fn write_responses<W>(
    connection: ConnectionId,
    mut sink: FramedWrite<W, EnvelopeCodec<Value, Response>>,
    mut responses_rx: mpsc::Receiver<Response>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = responses_rx.recv().await {
        let id = response.id.clone();
        match sink.send(response).await {
            Ok(()) => {}
            Err(CodecError::Io(err)) => {
                info!(connection, error = %err, "connection writer stopped");
                return;
            }
            Err(err) => {
                // Nothing was written for the failed envelope, so the stream is still in sync.
                warn!(connection, request_id = ?id, error = %err, "failed to encode response");
                let fallback = Response::error(id, INTERNAL_ERROR, "failed to encode response");
                if let Err(err) = sink.send(fallback).await {
                    info!(connection, error = %err, "connection writer stopped");
                    return;
                }
            }
        }
    }
}
