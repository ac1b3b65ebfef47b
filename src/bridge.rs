//! Stdio bridge between the presentation process and the gateway.
//!
//! The console's UI shell writes one JSON object per line and reads one
//! JSON object back per line: outbound calls come as plain [`Call`]s,
//! plus operations for the pending-sync indicator, the resolved server
//! address and a store reset. Logging goes to a file, never here.

use color_eyre::Result;
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::gateway::{Call, Envelope, Gateway};

/// One request line from the presentation process.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BridgeRequest {
  Op { op: Op },
  Call(Call),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Op {
  Status,
  Config,
  Reset,
}

/// Serve requests line by line until stdin closes.
pub async fn run(gateway: Gateway) -> Result<()> {
  let stdin = BufReader::new(tokio::io::stdin());
  let mut stdout = tokio::io::stdout();
  let mut lines = stdin.lines();

  while let Some(line) = lines.next_line().await? {
    let line = line.trim();
    if line.is_empty() {
      continue;
    }

    let reply = match serde_json::from_str::<BridgeRequest>(line) {
      Ok(BridgeRequest::Op { op: Op::Status }) => serde_json::to_value(gateway.status())?,
      Ok(BridgeRequest::Op { op: Op::Config }) => {
        json!({ "base_url": gateway.resolved_config().base_url().as_str() })
      }
      Ok(BridgeRequest::Op { op: Op::Reset }) => serde_json::to_value(gateway.reset())?,
      Ok(BridgeRequest::Call(call)) => serde_json::to_value(gateway.execute(&call).await)?,
      Err(e) => {
        debug!("rejecting malformed request line: {}", e);
        serde_json::to_value(Envelope::client_error(format!("malformed request: {}", e)))?
      }
    };

    let mut out = serde_json::to_vec(&reply)?;
    out.push(b'\n');
    stdout.write_all(&out).await?;
    stdout.flush().await?;
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_op_lines_parse_as_operations() {
    let request: BridgeRequest = serde_json::from_str(r#"{"op":"status"}"#).unwrap();
    assert!(matches!(request, BridgeRequest::Op { op: Op::Status }));

    let request: BridgeRequest = serde_json::from_str(r#"{"op":"config"}"#).unwrap();
    assert!(matches!(request, BridgeRequest::Op { op: Op::Config }));

    let request: BridgeRequest = serde_json::from_str(r#"{"op":"reset"}"#).unwrap();
    assert!(matches!(request, BridgeRequest::Op { op: Op::Reset }));
  }

  #[test]
  fn test_call_lines_parse_as_calls() {
    let request: BridgeRequest =
      serde_json::from_str(r#"{"url":"/orders","method":"POST","data":{"sku":"A1"}}"#).unwrap();

    match request {
      BridgeRequest::Call(call) => {
        assert_eq!(call.url, "/orders");
        assert_eq!(call.effective_method(), "POST");
      }
      other => panic!("expected a call, got {:?}", other),
    }
  }

  #[test]
  fn test_garbage_lines_do_not_parse() {
    assert!(serde_json::from_str::<BridgeRequest>(r#"{"neither":"thing"}"#).is_err());
    assert!(serde_json::from_str::<BridgeRequest>("not json").is_err());
  }
}
