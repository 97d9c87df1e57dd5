//! Line-delimited JSON tool server.
//!
//! Each input line is `{"id"?, "tool", "arguments"?}`; each answer is one
//! line `{"id"?, "result"}`. Requests are handled one at a time, in order.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::codebeamer::{SmartClient, Transport};
use crate::tools;

#[derive(Debug, Deserialize)]
struct ToolRequest {
  #[serde(default)]
  id: Option<Value>,
  tool: String,
  #[serde(default)]
  arguments: Value,
}

#[derive(Debug, Serialize)]
struct ToolResponse {
  #[serde(skip_serializing_if = "Option::is_none")]
  id: Option<Value>,
  result: Value,
}

/// Serve requests from `input` until it is closed.
pub async fn serve<T, R, W>(client: &SmartClient<T>, input: R, mut output: W) -> Result<()>
where
  T: Transport,
  R: AsyncBufRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut lines = input.lines();
  let mut handled = 0u64;
  info!("Serving tool requests");

  while let Some(line) = lines
    .next_line()
    .await
    .map_err(|e| eyre!("Failed to read request: {}", e))?
  {
    let line = line.trim();
    if line.is_empty() {
      continue;
    }

    let response = match serde_json::from_str::<ToolRequest>(line) {
      Ok(request) => {
        debug!(tool = %request.tool, "Request");
        ToolResponse {
          result: tools::handle(client, &request.tool, request.arguments).await,
          id: request.id,
        }
      }
      Err(e) => {
        warn!(error = %e, "Malformed request line");
        ToolResponse {
          id: None,
          result: json!({ "error": format!("Malformed request: {}", e) }),
        }
      }
    };

    let mut encoded =
      serde_json::to_vec(&response).map_err(|e| eyre!("Failed to encode response: {}", e))?;
    encoded.push(b'\n');
    output
      .write_all(&encoded)
      .await
      .map_err(|e| eyre!("Failed to write response: {}", e))?;
    output
      .flush()
      .await
      .map_err(|e| eyre!("Failed to write response: {}", e))?;
    handled += 1;
  }

  info!(handled, "Input closed, stopping");
  Ok(())
}
