// twsgate/src/contract.rs
// Instrument descriptions and the reference/historical/scanner payloads keyed by them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SecType {
  #[default]
  Stock,          // STK
  Option,         // OPT
  Future,         // FUT
  Forex,          // CASH
  Index,          // IND
  Cfd,            // CFD
  Crypto,         // CRYPTO
}

impl fmt::Display for SecType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      SecType::Stock => "STK",
      SecType::Option => "OPT",
      SecType::Future => "FUT",
      SecType::Forex => "CASH",
      SecType::Index => "IND",
      SecType::Cfd => "CFD",
      SecType::Crypto => "CRYPTO",
    };
    write!(f, "{}", s)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Contract {
  pub con_id: i32,
  pub symbol: String,
  pub sec_type: SecType,
  pub exchange: String,
  pub primary_exchange: Option<String>,
  pub currency: String,
  pub local_symbol: Option<String>,
}

impl Contract {
  /// Create a new stock contract routed through SMART in USD
  pub fn stock(symbol: &str) -> Self {
    Self::stock_with_exchange(symbol, "SMART", "USD")
  }

  /// Create a new stock contract with specified exchange and currency
  pub fn stock_with_exchange(symbol: &str, exchange: &str, currency: &str) -> Self {
    Contract {
      symbol: symbol.to_string(),
      sec_type: SecType::Stock,
      exchange: exchange.to_string(),
      currency: currency.to_string(),
      ..Default::default()
    }
  }
}

/// Detailed contract information
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContractDetails {
  pub contract: Contract,
  pub market_name: String,
  pub long_name: String,
  pub min_tick: f64,
  pub order_types: String,
  pub valid_exchanges: String,
  pub industry: String,
  pub category: String,
  pub subcategory: String,
  pub time_zone_id: String,
  pub trading_hours: String,
  pub liquid_hours: String,
  pub stock_type: String,
}

/// Bar data for historical data requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
  pub time: DateTime<Utc>,
  pub open: f64,
  pub high: f64,
  pub low: f64,
  pub close: f64,
  pub volume: i64,
  pub wap: f64,
  pub count: i32,
}

/// Bar size for historical data requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BarSize {
  OneSecond,
  FiveSeconds,
  OneMinute,
  FiveMinutes,
  FifteenMinutes,
  ThirtyMinutes,
  OneHour,
  OneDay,
  OneWeek,
}

impl fmt::Display for BarSize {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      BarSize::OneSecond => "1 secs",
      BarSize::FiveSeconds => "5 secs",
      BarSize::OneMinute => "1 min",
      BarSize::FiveMinutes => "5 mins",
      BarSize::FifteenMinutes => "15 mins",
      BarSize::ThirtyMinutes => "30 mins",
      BarSize::OneHour => "1 hour",
      BarSize::OneDay => "1 day",
      BarSize::OneWeek => "1 week",
    };
    write!(f, "{}", s)
  }
}

/// What to show for historical data requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WhatToShow {
  Trades,
  Midpoint,
  Bid,
  Ask,
  BidAsk,
  HistoricalVolatility,
  ImpliedVolatility,
}

impl fmt::Display for WhatToShow {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      WhatToShow::Trades => "TRADES",
      WhatToShow::Midpoint => "MIDPOINT",
      WhatToShow::Bid => "BID",
      WhatToShow::Ask => "ASK",
      WhatToShow::BidAsk => "BID_ASK",
      WhatToShow::HistoricalVolatility => "HISTORICAL_VOLATILITY",
      WhatToShow::ImpliedVolatility => "OPTION_IMPLIED_VOLATILITY",
    };
    write!(f, "{}", s)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagValue {
  pub tag: String,
  pub value: String,
}

impl TagValue {
  pub fn new(tag: &str, value: &str) -> Self {
    TagValue { tag: tag.to_string(), value: value.to_string() }
  }
}

/// Parameters of a market scanner subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerSubscription {
  pub number_of_rows: i32,
  pub instrument: String,
  pub location_code: String,
  pub scan_code: String,
  pub above_price: Option<f64>,
  pub below_price: Option<f64>,
  pub above_volume: Option<i32>,
  pub market_cap_above: Option<f64>,
  pub market_cap_below: Option<f64>,
  pub stock_type_filter: Option<String>,
}

impl Default for ScannerSubscription {
  fn default() -> Self {
    ScannerSubscription {
      number_of_rows: 50,
      instrument: "STK".to_string(),
      location_code: "STK.US.MAJOR".to_string(),
      scan_code: "TOP_PERC_GAIN".to_string(),
      above_price: None,
      below_price: None,
      above_volume: None,
      market_cap_above: None,
      market_cap_below: None,
      stock_type_filter: None,
    }
  }
}

/// One ranked row of a scanner result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanData {
  pub rank: i32,
  pub contract_details: ContractDetails,
  pub distance: String,
  pub benchmark: String,
  pub projection: String,
  pub legs: String,
}
