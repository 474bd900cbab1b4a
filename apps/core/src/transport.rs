use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::contract::{ContractError, HostCall, PluginRequest};
use crate::orchestrator::PluginHandler;

const CONTENT_LENGTH: &str = "content-length";
// Upper bound on a single frame; the launcher never sends anything close.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid frame header: {0}")]
    InvalidHeader(String),
    #[error("frame is missing a content-length header")]
    MissingContentLength,
    #[error("host did not answer {0} in time")]
    HostTimeout(String),
    #[error("host rejected request {id}: {message}")]
    HostError { id: u64, message: String },
    #[error("connection closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ParseError,
    InvalidParams,
    MethodNotFound,
}

impl ErrorCode {
    pub fn code(self) -> i64 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidParams => -32602,
            Self::MethodNotFound => -32601,
        }
    }
}

impl From<&ContractError> for ErrorCode {
    fn from(error: &ContractError) -> Self {
        match error {
            ContractError::UnknownMethod(_) => Self::MethodNotFound,
            ContractError::InvalidParams { .. } => Self::InvalidParams,
        }
    }
}

/// Reads one `Content-Length` framed message. Returns `Ok(None)` on a clean
/// end of stream between frames.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Value>, TransportError>
where
    R: AsyncBufRead + Unpin,
{
    read_frame(reader, None).await
}

/// Discards input up to the next `Content-Length` header, then reads that
/// frame. The header may follow leftover body bytes on the same line.
pub async fn resync_and_read<R>(reader: &mut R) -> Result<Option<Value>, TransportError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        if let Some(offset) = line.to_ascii_lowercase().find(CONTENT_LENGTH) {
            debug!(skipped = offset, "resynchronized on a frame header");
            return read_frame(reader, Some(line[offset..].to_string())).await;
        }
    }
}

async fn read_frame<R>(reader: &mut R, first_line: Option<String>) -> Result<Option<Value>, TransportError>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length = None;
    let mut saw_header = false;
    let mut carried = first_line;
    let mut line = String::new();

    loop {
        line.clear();
        match carried.take() {
            Some(header) => line.push_str(&header),
            None => {
                if reader.read_line(&mut line).await? == 0 {
                    if saw_header {
                        return Err(TransportError::Closed);
                    }
                    return Ok(None);
                }
            }
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            if saw_header {
                break;
            }
            continue;
        }
        saw_header = true;

        let Some((name, value)) = trimmed.split_once(':') else {
            return Err(TransportError::InvalidHeader(trimmed.to_string()));
        };
        if name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
            let length = value
                .trim()
                .parse::<usize>()
                .map_err(|_| TransportError::InvalidHeader(trimmed.to_string()))?;
            if length > MAX_FRAME_BYTES {
                return Err(TransportError::InvalidHeader(format!(
                    "frame of {length} bytes exceeds limit"
                )));
            }
            content_length = Some(length);
        }
    }

    let length = content_length.ok_or(TransportError::MissingContentLength)?;
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

pub fn encode_frame(message: &Value) -> Result<Vec<u8>, TransportError> {
    let body = serde_json::to_vec(message)?;
    let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub async fn write_message<W>(writer: &mut W, message: &Value) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type Waiter = oneshot::Sender<Result<Value, TransportError>>;
type Pending = Arc<Mutex<HashMap<u64, Waiter>>>;

/// Write half of the connection, shared by every request task. Also tracks
/// requests we sent to the host until their responses arrive.
#[derive(Clone)]
pub struct HostConnection {
    writer: Arc<AsyncMutex<BoxedWriter>>,
    pending: Pending,
    next_id: Arc<AtomicU64>,
    host_timeout: Duration,
}

impl HostConnection {
    pub fn new<W>(writer: W, host_timeout: Duration) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: Arc::new(AsyncMutex::new(Box::new(writer))),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            host_timeout,
        }
    }

    pub async fn send(&self, message: &Value) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        write_message(&mut *writer, message).await
    }

    pub async fn respond(&self, id: Value, result: Value) -> Result<(), TransportError> {
        self.send(&json!({ "jsonrpc": "2.0", "id": id, "result": result }))
            .await
    }

    pub async fn respond_error(&self, id: Value, code: ErrorCode, message: &str) -> Result<(), TransportError> {
        self.send(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": code.code(), "message": message },
        }))
        .await
    }

    /// Writes a host-bound request and returns a receiver for its answer.
    /// The write completes before this returns, so anything sent afterwards
    /// reaches the host after the request.
    pub async fn start_request(
        &self,
        method: &str,
        params: Value,
    ) -> Result<oneshot::Receiver<Result<Value, TransportError>>, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending_slot().insert(id, tx);

        let message = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        if let Err(err) = self.send(&message).await {
            self.pending_slot().remove(&id);
            return Err(err);
        }
        Ok(rx)
    }

    pub async fn request(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        let rx = self.start_request(method, params).await?;
        self.await_answer(method, rx).await
    }

    async fn await_answer(
        &self,
        method: &str,
        rx: oneshot::Receiver<Result<Value, TransportError>>,
    ) -> Result<Value, TransportError> {
        match tokio::time::timeout(self.host_timeout, rx).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::HostTimeout(method.to_string())),
        }
    }

    /// Routes a response from the host to whoever is waiting for it.
    pub fn resolve(&self, message: &Value) {
        let Some(id) = message.get("id").and_then(Value::as_u64) else {
            warn!("host response without a numeric id");
            return;
        };
        let Some(tx) = self.pending_slot().remove(&id) else {
            debug!(id, "host response for an unknown request");
            return;
        };

        let answer = match message.get("error") {
            Some(error) => Err(TransportError::HostError {
                id,
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            }),
            None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
        };
        let _ = tx.send(answer);
    }

    fn fail_pending(&self) {
        for (_, tx) in self.pending_slot().drain() {
            let _ = tx.send(Err(TransportError::Closed));
        }
    }

    fn pending_slot(&self) -> MutexGuard<'_, HashMap<u64, Waiter>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Serves the launcher until stdin closes or it sends `exit`/`close`.
/// In-flight requests are finished and answered before this returns.
pub async fn serve<R, W>(
    reader: R,
    writer: W,
    handler: Arc<dyn PluginHandler>,
    host_timeout: Duration,
) -> Result<(), TransportError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut reader = reader;
    let connection = HostConnection::new(writer, host_timeout);
    let mut tasks = JoinSet::new();
    let mut resync = false;

    let result = loop {
        let next = if resync {
            resync_and_read(&mut reader).await
        } else {
            read_message(&mut reader).await
        };
        resync = false;

        let message = match next {
            Ok(Some(message)) => message,
            Ok(None) => {
                info!("launcher closed the connection");
                break Ok(());
            }
            Err(TransportError::Json(err)) => {
                warn!(%err, "dropping unparsable message");
                if let Err(err) = connection
                    .respond_error(Value::Null, ErrorCode::ParseError, &err.to_string())
                    .await
                {
                    break Err(err);
                }
                continue;
            }
            Err(err @ (TransportError::InvalidHeader(_) | TransportError::MissingContentLength)) => {
                warn!(%err, "malformed frame; skipping to the next header");
                resync = true;
                continue;
            }
            Err(err) => break Err(err),
        };

        // Reap finished tasks so the set does not grow for the whole session.
        while let Some(joined) = tasks.try_join_next() {
            if let Err(err) = joined {
                error!(%err, "request task panicked");
            }
        }

        let method = message.get("method").and_then(Value::as_str).map(str::to_string);
        let id = message.get("id").cloned().filter(|id| !id.is_null());

        match (method, id) {
            (Some(method), Some(id)) => {
                let params = message.get("params").cloned().unwrap_or(Value::Null);
                let handler = Arc::clone(&handler);
                let connection = connection.clone();
                tasks.spawn(async move {
                    if let Err(err) = dispatch(&connection, handler.as_ref(), &method, id, params).await {
                        error!(method = %method, %err, "failed to answer request");
                    }
                });
            }
            (Some(method), None) => {
                if matches!(method.as_str(), "exit" | "close") {
                    info!(method = %method, "launcher asked the plugin to exit");
                    break Ok(());
                }
                debug!(method = %method, "ignoring notification");
            }
            (None, Some(_)) => connection.resolve(&message),
            (None, None) => warn!("message has neither method nor id"),
        }
    };

    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            error!(%err, "request task panicked");
        }
    }
    connection.fail_pending();
    result
}

async fn dispatch(
    connection: &HostConnection,
    handler: &dyn PluginHandler,
    method: &str,
    id: Value,
    params: Value,
) -> Result<(), TransportError> {
    let request = match PluginRequest::parse(method, params) {
        Ok(request) => request,
        Err(err) => {
            warn!(method, %err, "rejecting request");
            return connection
                .respond_error(id, ErrorCode::from(&err), &err.to_string())
                .await;
        }
    };

    let outcome = handler.handle(request).await;
    for call in outcome.host_calls {
        send_host_call(connection, call).await;
    }
    connection.respond(id, serde_json::to_value(&outcome.response)?).await
}

/// Sends the call, then waits for the host's answer off the request path so
/// a slow or silent host never delays our reply.
async fn send_host_call(connection: &HostConnection, call: HostCall) {
    let method = call.method();
    match connection.start_request(method, call.params()).await {
        Ok(rx) => {
            let connection = connection.clone();
            tokio::spawn(async move {
                if let Err(err) = connection.await_answer(method, rx).await {
                    debug!(method, %err, "host call not acknowledged");
                }
            });
        }
        Err(err) => warn!(method, %err, "failed to send host call"),
    }
}
