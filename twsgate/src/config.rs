// twsgate/src/config.rs
//! Connection, timeout and reconnection settings.
//!
//! Every value has a default matching the behaviour of a stock IB Gateway paper
//! setup: 10 second request bound, 10 reconnect attempts on a
//! 1/2/4/8/16/30 second schedule, reconnects only between 04:00 and 20:00
//! New York time.

use crate::base::GatewayError;
use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// (De)serializes a `Duration` as integer milliseconds.
mod duration_ms {
  use serde::{Deserialize, Deserializer, Serializer};
  use std::time::Duration;

  pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    Ok(Duration::from_millis(u64::deserialize(d)?))
  }
}

mod duration_ms_vec {
  use serde::{Deserialize, Deserializer, Serializer};
  use std::time::Duration;

  pub fn serialize<S: Serializer>(v: &[Duration], s: S) -> Result<S::Ok, S::Error> {
    s.collect_seq(v.iter().map(|d| d.as_millis() as u64))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Duration>, D::Error> {
    Ok(Vec::<u64>::deserialize(d)?.into_iter().map(Duration::from_millis).collect())
  }
}

/// Wall-clock window during which automatic reconnection is allowed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperatingHours {
  /// IANA zone name, e.g. "America/New_York".
  pub time_zone: String,
  pub start: NaiveTime,
  pub end: NaiveTime,
}

impl OperatingHours {
  pub fn new(time_zone: &str, start: NaiveTime, end: NaiveTime) -> Self {
    OperatingHours { time_zone: time_zone.to_string(), start, end }
  }

  /// Extended US equity hours, 04:00 to 20:00 Eastern.
  pub fn us_extended() -> Self {
    Self::new(
      "America/New_York",
      NaiveTime::from_hms_opt(4, 0, 0).unwrap_or_default(),
      NaiveTime::from_hms_opt(20, 0, 0).unwrap_or_default(),
    )
  }

  pub fn tz(&self) -> Result<Tz, GatewayError> {
    self.time_zone.parse::<Tz>()
      .map_err(|e| GatewayError::ConfigurationError(format!("Invalid time zone '{}': {}", self.time_zone, e)))
  }

  /// Whether `now` falls inside the window. Both bounds are inclusive; a window
  /// whose start is after its end wraps midnight.
  pub fn allows(&self, now: DateTime<Utc>) -> Result<bool, GatewayError> {
    let local = now.with_timezone(&self.tz()?).time();
    if self.start <= self.end {
      Ok(local >= self.start && local <= self.end)
    } else {
      Ok(local >= self.start || local <= self.end)
    }
  }
}

/// Settings for a [`ConnectionManager`](crate::connection::ConnectionManager).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
  pub host: String,
  pub port: u16,
  pub client_id: i32,
  /// Passed to the session before connecting (e.g. "+PACEAPI").
  pub connect_options: String,
  /// Upper bound for every request operation.
  #[serde(rename = "request_timeout_ms", with = "duration_ms")]
  pub request_timeout: Duration,
  /// How long `connect` waits for the initial order id.
  #[serde(rename = "handshake_timeout_ms", with = "duration_ms")]
  pub handshake_timeout: Duration,
  pub max_reconnect_attempts: u32,
  /// Delay before attempt N is `reconnect_delays[N-1]`, capped at the last entry.
  #[serde(rename = "reconnect_delays_ms", with = "duration_ms_vec")]
  pub reconnect_delays: Vec<Duration>,
  /// Pause after tearing down a stale session before reconnecting.
  #[serde(rename = "teardown_pause_ms", with = "duration_ms")]
  pub teardown_pause: Duration,
  /// `None` disables the operating-hours gate.
  pub operating_hours: Option<OperatingHours>,
  /// Account group used for account summary requests.
  pub account_summary_group: String,
}

impl Default for GatewayConfig {
  fn default() -> Self {
    GatewayConfig {
      host: "127.0.0.1".to_string(),
      port: 4002, // IB Gateway paper
      client_id: 2,
      connect_options: "+PACEAPI".to_string(),
      request_timeout: Duration::from_secs(10),
      handshake_timeout: Duration::from_secs(10),
      max_reconnect_attempts: 10,
      reconnect_delays: [1, 2, 4, 8, 16, 30].iter().map(|s| Duration::from_secs(*s)).collect(),
      teardown_pause: Duration::from_millis(500),
      operating_hours: Some(OperatingHours::us_extended()),
      account_summary_group: "All".to_string(),
    }
  }
}

impl GatewayConfig {
  /// Loads a JSON config file. Missing keys take their default value.
  pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, GatewayError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
      .map_err(|e| GatewayError::ConfigurationError(format!("Reading {:?}: {}", path, e)))?;
    let config: GatewayConfig = serde_json::from_str(&text)
      .map_err(|e| GatewayError::ConfigurationError(format!("Parsing {:?}: {}", path, e)))?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<(), GatewayError> {
    if self.host.is_empty() {
      return Err(GatewayError::ConfigurationError("host must not be empty".to_string()));
    }
    if self.port == 0 {
      return Err(GatewayError::ConfigurationError("port must not be 0".to_string()));
    }
    if self.request_timeout.is_zero() {
      return Err(GatewayError::ConfigurationError("request_timeout must be positive".to_string()));
    }
    if self.handshake_timeout.is_zero() {
      return Err(GatewayError::ConfigurationError("handshake_timeout must be positive".to_string()));
    }
    if self.max_reconnect_attempts == 0 {
      return Err(GatewayError::ConfigurationError("max_reconnect_attempts must be at least 1".to_string()));
    }
    if self.reconnect_delays.is_empty() {
      return Err(GatewayError::ConfigurationError("reconnect_delays must not be empty".to_string()));
    }
    if let Some(hours) = &self.operating_hours {
      hours.tz()?;
    }
    Ok(())
  }

  /// Delay before the given 1-based reconnect attempt.
  pub fn reconnect_delay(&self, attempt: u32) -> Duration {
    let last = self.reconnect_delays.len().saturating_sub(1);
    let idx = (attempt.max(1) as usize - 1).min(last);
    self.reconnect_delays.get(idx).copied().unwrap_or_default()
  }

  /// Whether reconnecting is allowed at `now`. An unparseable zone counts as closed.
  pub fn within_operating_hours(&self, now: DateTime<Utc>) -> bool {
    match &self.operating_hours {
      None => true,
      Some(hours) => hours.allows(now).unwrap_or(false),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;
  use std::io::Write;

  #[test]
  fn test_defaults_are_valid() {
    let config = GatewayConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.request_timeout, Duration::from_secs(10));
    assert_eq!(config.max_reconnect_attempts, 10);
  }

  #[test]
  fn test_reconnect_delay_schedule_is_capped() {
    let config = GatewayConfig::default();
    assert_eq!(config.reconnect_delay(1), Duration::from_secs(1));
    assert_eq!(config.reconnect_delay(4), Duration::from_secs(8));
    assert_eq!(config.reconnect_delay(6), Duration::from_secs(30));
    assert_eq!(config.reconnect_delay(7), Duration::from_secs(30));
    assert_eq!(config.reconnect_delay(50), Duration::from_secs(30));
  }

  #[test]
  fn test_operating_hours_gate() {
    let hours = OperatingHours::us_extended();
    // 14:00 UTC in July is 10:00 in New York (EDT).
    let open = Utc.with_ymd_and_hms(2025, 7, 15, 14, 0, 0).unwrap();
    assert!(hours.allows(open).unwrap());
    // 02:00 UTC is 22:00 the previous evening in New York.
    let closed = Utc.with_ymd_and_hms(2025, 7, 15, 2, 0, 0).unwrap();
    assert!(!hours.allows(closed).unwrap());
    // Exactly 20:00 New York is still inside.
    let edge = Utc.with_ymd_and_hms(2025, 7, 16, 0, 0, 0).unwrap();
    assert!(hours.allows(edge).unwrap());
  }

  #[test]
  fn test_operating_hours_wrapping_midnight() {
    let hours = OperatingHours::new(
      "UTC",
      NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
      NaiveTime::from_hms_opt(2, 0, 0).unwrap(),
    );
    assert!(hours.allows(Utc.with_ymd_and_hms(2025, 1, 1, 23, 30, 0).unwrap()).unwrap());
    assert!(hours.allows(Utc.with_ymd_and_hms(2025, 1, 1, 1, 0, 0).unwrap()).unwrap());
    assert!(!hours.allows(Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()).unwrap());
  }

  #[test]
  fn test_gate_disabled() {
    let mut config = GatewayConfig::default();
    config.operating_hours = None;
    assert!(config.within_operating_hours(Utc.with_ymd_and_hms(2025, 1, 1, 3, 0, 0).unwrap()));
  }

  #[test]
  fn test_validation_failures() {
    let mut config = GatewayConfig::default();
    config.reconnect_delays.clear();
    assert!(matches!(config.validate(), Err(GatewayError::ConfigurationError(_))));

    let mut config = GatewayConfig::default();
    config.request_timeout = Duration::ZERO;
    assert!(config.validate().is_err());

    let mut config = GatewayConfig::default();
    config.operating_hours = Some(OperatingHours::new("Mars/Olympus", NaiveTime::MIN, NaiveTime::MIN));
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_from_file_fills_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"port": 7497, "request_timeout_ms": 2500, "reconnect_delays_ms": [100, 200], "operating_hours": null}}"#).unwrap();
    let config = GatewayConfig::from_file(file.path()).unwrap();
    assert_eq!(config.port, 7497);
    assert_eq!(config.host, "127.0.0.1");
    assert_eq!(config.request_timeout, Duration::from_millis(2500));
    assert_eq!(config.reconnect_delays, vec![Duration::from_millis(100), Duration::from_millis(200)]);
    assert!(config.operating_hours.is_none());
  }

  #[test]
  fn test_from_file_rejects_invalid() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"max_reconnect_attempts": 0}}"#).unwrap();
    assert!(GatewayConfig::from_file(file.path()).is_err());
  }
}
