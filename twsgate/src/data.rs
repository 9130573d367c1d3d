// twsgate/src/data.rs
// Market data payloads and request parameters.

use crate::contract::{BarSize, Contract, WhatToShow, TagValue};
use num_enum::TryFromPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Price tick fields delivered by `tickPrice`.
/// Based on `https://interactivebrokers.github.io/tws-api/tick_types.html`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, Serialize, Deserialize)]
#[repr(i32)]
pub enum TickType {
  BidPrice = 1,
  AskPrice = 2,
  LastPrice = 4,
  High = 6,
  Low = 7,
  ClosePrice = 9,
  OpenTick = 14,
  Low13Weeks = 15,
  High13Weeks = 16,
  Low52Weeks = 19,
  High52Weeks = 20,
  MarkPrice = 37,
  DelayedBid = 66,
  DelayedAsk = 67,
  DelayedLast = 68,
  DelayedHighPrice = 72,
  DelayedLowPrice = 73,
  DelayedClose = 75,
  DelayedOpen = 76,
}

impl TickType {
  /// Parses a raw tick field number; unknown fields yield `None`.
  pub fn from_field(field: i32) -> Option<Self> {
    TickType::try_from(field).ok()
  }
}

/// Tick attributes for price ticks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TickAttrib {
  pub can_auto_execute: bool,
  pub past_limit: bool,
  pub pre_open: bool,
}

/// One price tick of a quote snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickPrice {
  pub field: TickType,
  pub price: f64,
  #[serde(default)]
  pub attribs: TickAttrib,
}

impl TickPrice {
  /// Price of the first tick with the given field, if present.
  pub fn find(ticks: &[TickPrice], field: TickType) -> Option<f64> {
    ticks.iter().find(|t| t.field == field).map(|t| t.price)
  }
}

/// Market data type announced by the gateway (`marketDataType` callback).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MarketDataType {
  #[default]
  Unknown = 0,
  RealTime = 1,
  Frozen = 2,
  Delayed = 3,
  DelayedFrozen = 4,
}

impl From<i32> for MarketDataType {
  fn from(v: i32) -> Self {
    match v {
      1 => MarketDataType::RealTime,
      2 => MarketDataType::Frozen,
      3 => MarketDataType::Delayed,
      4 => MarketDataType::DelayedFrozen,
      _ => MarketDataType::Unknown,
    }
  }
}

impl MarketDataType {
  pub fn is_delayed(self) -> bool {
    matches!(self, MarketDataType::Delayed | MarketDataType::DelayedFrozen)
  }
}

impl fmt::Display for MarketDataType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      MarketDataType::Unknown => "UNKNOWN",
      MarketDataType::RealTime => "REALTIME",
      MarketDataType::Frozen => "FROZEN",
      MarketDataType::Delayed => "DELAYED",
      MarketDataType::DelayedFrozen => "DELAYED_FROZEN",
    };
    write!(f, "{}", s)
  }
}

/// Parameters of a quote request (`reqMktData`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketDataRequest {
  pub contract: Contract,
  /// Comma separated generic tick ids; must be empty for snapshots.
  pub generic_tick_list: String,
  pub snapshot: bool,
  pub regulatory_snapshot: bool,
  pub options: Vec<TagValue>,
}

impl MarketDataRequest {
  /// A one-shot snapshot of the default tick types, terminated by `tickSnapshotEnd`.
  pub fn snapshot(contract: Contract) -> Self {
    MarketDataRequest {
      contract,
      generic_tick_list: String::new(),
      snapshot: true,
      regulatory_snapshot: false,
      options: Vec::new(),
    }
  }
}

/// Parameters of a historical bars request (`reqHistoricalData`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalDataRequest {
  pub contract: Contract,
  /// "yyyyMMdd HH:mm:ss [TZ]" or empty for now.
  pub end_date_time: String,
  /// Number and unit, e.g. "30 D", "1 M", "3600 S".
  pub duration: String,
  pub bar_size: BarSize,
  pub what_to_show: WhatToShow,
  pub use_rth: bool,
  /// 1 for human readable timestamps, 2 for epoch seconds.
  pub format_date: i32,
  pub keep_up_to_date: bool,
  pub chart_options: Vec<TagValue>,
}

impl HistoricalDataRequest {
  pub fn new(contract: Contract, duration: &str, bar_size: BarSize) -> Self {
    HistoricalDataRequest {
      contract,
      end_date_time: String::new(),
      duration: duration.to_string(),
      bar_size,
      what_to_show: WhatToShow::Trades,
      use_rth: true,
      format_date: 1,
      keep_up_to_date: false,
      chart_options: Vec::new(),
    }
  }
}
