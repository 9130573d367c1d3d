// twsgate/src/base.rs
// Error definitions shared by the whole crate.

use thiserror::Error;

/// Errors surfaced by the gateway runtime.
///
/// Every request operation returns one of these as its failure arm, so callers
/// branch on the failure kind (timeout, connection loss, gateway error, ...)
/// instead of inspecting messages.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
  #[error("Configuration error: {0}")]
  ConfigurationError(String),

  #[error("Connection failed: {0}")]
  ConnectionFailed(String),

  #[error("Not connected to the gateway")]
  NotConnected,

  #[error("Already connected to the gateway")]
  AlreadyConnected,

  #[error("Connection lost: {0}")]
  ConnectionLost(String),

  #[error("Request timeout: {0}")]
  Timeout(String),

  #[error("Duplicate request ID: {0}")]
  DuplicateRequestId(i32),

  #[error("API error: id={id}, code={code}, msg={message}")]
  ApiError { id: i32, code: i32, message: String },

  #[error("Invalid order: {0}")]
  InvalidOrder(String),

  #[error("Invalid parameter: {0}")]
  InvalidParameter(String),

  #[error("No data: {0}")]
  NoData(String),

  #[error("Send failed: {0}")]
  SendFailed(String),

  #[error("Internal error: {0}")]
  InternalError(String),
}

/// A real (error-severity) error frame reported by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayErrorReport {
  pub id: i32,
  pub code: i32,
  pub message: String,
}

impl From<GatewayErrorReport> for GatewayError {
  fn from(report: GatewayErrorReport) -> Self {
    GatewayError::ApiError { id: report.id, code: report.code, message: report.message }
  }
}

impl GatewayError {
  /// True for failures caused by the session going away rather than by the request itself.
  pub fn is_connection_error(&self) -> bool {
    matches!(
      self,
      GatewayError::ConnectionFailed(_) | GatewayError::NotConnected | GatewayError::ConnectionLost(_)
    )
  }

  pub fn is_timeout(&self) -> bool {
    matches!(self, GatewayError::Timeout(_))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_error_kinds() {
    assert!(GatewayError::ConnectionLost("gone".to_string()).is_connection_error());
    assert!(GatewayError::NotConnected.is_connection_error());
    assert!(!GatewayError::Timeout("slow".to_string()).is_connection_error());
    assert!(GatewayError::Timeout("slow".to_string()).is_timeout());
  }

  #[test]
  fn test_api_error_display() {
    let err = GatewayError::ApiError { id: 1001, code: 200, message: "No security definition".to_string() };
    assert_eq!(err.to_string(), "API error: id=1001, code=200, msg=No security definition");
  }

  #[test]
  fn test_report_converts_to_api_error() {
    let report = GatewayErrorReport { id: 7, code: 162, message: "pacing violation".to_string() };
    assert_eq!(GatewayError::from(report), GatewayError::ApiError { id: 7, code: 162, message: "pacing violation".to_string() });
  }
}
