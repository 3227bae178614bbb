//! Newline-delimited JSON tool channel.
//!
//! One bidirectional byte stream per provider subprocess; requests never
//! interleave, the channel is strictly call/response. Diagnostics must
//! never be written to the outbound stream — both binaries log to
//! stderr.

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ProviderError;
use crate::provider::RequestContext;

/// Graceful-shutdown tool understood by every tool server.
pub const TOOL_SHUTDOWN: &str = "shutdown";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRequest {
    pub id: u64,
    pub tool: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResponse {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProviderError>,
}

impl ToolResponse {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, error: ProviderError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Collapse the response into the tool result.
    pub fn into_result(self) -> Result<Value, ProviderError> {
        match (self.result, self.error) {
            (_, Some(err)) => Err(err),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("channel codec: {0}")]
    Codec(#[from] LinesCodecError),
    #[error("malformed frame: {0}")]
    Frame(#[from] serde_json::Error),
    #[error("peer closed the channel")]
    Closed,
    #[error("response id {got} does not match request id {want}")]
    IdMismatch { want: u64, got: u64 },
}

struct ClientInner<R, W> {
    reader: FramedRead<R, LinesCodec>,
    writer: FramedWrite<W, LinesCodec>,
    next_id: u64,
}

/// Caller side of the channel. Holds the stream pair behind a mutex so
/// at most one request is outstanding per peer.
pub struct ToolClient<R, W> {
    inner: Mutex<ClientInner<R, W>>,
}

impl<R, W> ToolClient<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            inner: Mutex::new(ClientInner {
                reader: FramedRead::new(reader, LinesCodec::new()),
                writer: FramedWrite::new(writer, LinesCodec::new()),
                next_id: 1,
            }),
        }
    }

    /// Issue one call and wait for the matching response.
    pub async fn call(&self, tool: &str, params: Value) -> Result<ToolResponse, ChannelError> {
        let mut inner = self.inner.lock().await;
        let id = inner.next_id;
        inner.next_id += 1;

        let frame = serde_json::to_string(&ToolRequest {
            id,
            tool: tool.to_string(),
            params,
        })?;
        debug!(tool, id, "tool request");
        inner.writer.send(frame).await?;

        let line = match inner.reader.next().await {
            Some(line) => line?,
            None => return Err(ChannelError::Closed),
        };
        let response: ToolResponse = serde_json::from_str(&line)?;
        if response.id != id {
            return Err(ChannelError::IdMismatch {
                want: id,
                got: response.id,
            });
        }
        Ok(response)
    }
}

/// Server side dispatch target.
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    async fn handle(
        &self,
        tool: &str,
        params: Value,
        ctx: &RequestContext,
    ) -> Result<Value, ProviderError>;
}

/// Read requests from `reader`, dispatch them to `handler`, write
/// responses to `writer`. Returns on EOF, on the `shutdown` tool, or
/// when `shutdown` token fires. Requests are handled strictly in order.
pub async fn serve<R, W, H>(
    reader: R,
    writer: W,
    handler: &H,
    shutdown: CancellationToken,
) -> Result<(), ChannelError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
    H: ToolHandler + ?Sized,
{
    let mut reader = FramedRead::new(reader, LinesCodec::new());
    let mut writer = FramedWrite::new(writer, LinesCodec::new());

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            line = reader.next() => match line {
                Some(line) => line?,
                None => return Ok(()),
            },
        };
        if line.trim().is_empty() {
            continue;
        }

        let request: ToolRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "dropping malformed request frame");
                let response =
                    ToolResponse::err(0, ProviderError::invalid_spec(format!("malformed request: {e}")));
                writer.send(serde_json::to_string(&response)?).await?;
                continue;
            }
        };

        if request.tool == TOOL_SHUTDOWN {
            debug!("shutdown requested by peer");
            let response = ToolResponse::ok(request.id, Value::Null);
            writer.send(serde_json::to_string(&response)?).await?;
            return Ok(());
        }

        let ctx = RequestContext::with_cancel(shutdown.child_token());
        let response = match handler.handle(&request.tool, request.params, &ctx).await {
            Ok(result) => ToolResponse::ok(request.id, result),
            Err(error) => ToolResponse::err(request.id, error),
        };
        writer.send(serde_json::to_string(&response)?).await?;
    }
}

/// Extract a required string parameter; absence is an immediate
/// `INVALID_SPEC` before any dispatch.
pub fn require_str(params: &Value, field: &str) -> Result<String, ProviderError> {
    match params.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::String(_)) => Err(ProviderError::invalid_spec(format!(
            "required field {field} is empty"
        ))),
        Some(_) => Err(ProviderError::invalid_spec(format!(
            "required field {field} must be a string"
        ))),
        None => Err(ProviderError::invalid_spec(format!(
            "missing required field {field}"
        ))),
    }
}

/// Extract a required object-valued parameter.
pub fn require_object(params: &Value, field: &str) -> Result<Value, ProviderError> {
    match params.get(field) {
        Some(value @ Value::Object(_)) => Ok(value.clone()),
        Some(_) => Err(ProviderError::invalid_spec(format!(
            "required field {field} must be an object"
        ))),
        None => Err(ProviderError::invalid_spec(format!(
            "missing required field {field}"
        ))),
    }
}
