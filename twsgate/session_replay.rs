// twsgate/session_replay.rs
use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;

use twsgate::account::{AccountSummaryEntry, TradingMode};
use twsgate::contract::{BarSize, Contract, ScannerSubscription};
use twsgate::data::{HistoricalDataRequest, MarketDataRequest};
use twsgate::session_mock::MockSession;
use twsgate::{ConnectionManager, GatewayConfig};

/// Run one request against a scripted gateway session and print the result.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
  /// JSON script describing what the gateway answers.
  #[arg(long)]
  script: PathBuf,

  /// Optional JSON config; missing keys take their defaults.
  #[arg(long)]
  config: Option<PathBuf>,

  #[clap(subcommand)]
  command: Command,
}

#[derive(Parser, Debug)]
enum Command {
  /// Snapshot quote for a stock.
  Quote { symbol: String },
  /// Historical bars for a stock.
  History {
    symbol: String,
    #[arg(long, default_value = "1 D")]
    duration: String,
  },
  /// Contract details for a stock.
  Details { symbol: String },
  /// Run a market scanner once.
  Scan {
    #[arg(long, default_value = "TOP_PERC_GAIN")]
    scan_code: String,
    #[arg(long, default_value_t = 10)]
    rows: i32,
  },
  /// All positions.
  Positions,
  /// All open orders.
  OpenOrders,
  /// Account summary values.
  Account {
    #[arg(long, value_delimiter = ',', default_value = "AccountType,NetLiquidation,BuyingPower")]
    tags: Vec<String>,
  },
}

fn load_config(path: Option<&PathBuf>) -> Result<GatewayConfig> {
  let mut config = match path {
    Some(p) => GatewayConfig::from_file(p).with_context(|| format!("Loading config {:?}", p))?,
    None => GatewayConfig::default(),
  };
  // Scripted sessions answer immediately and never need the reconnect window.
  config.operating_hours = None;
  Ok(config)
}

fn run(manager: &ConnectionManager, command: Command) -> Result<()> {
  match command {
    Command::Quote { symbol } => {
      for tick in manager.request_quote(MarketDataRequest::snapshot(Contract::stock(&symbol)))? {
        println!("{:?}\t{}", tick.field, tick.price);
      }
    }
    Command::History { symbol, duration } => {
      let request = HistoricalDataRequest::new(Contract::stock(&symbol), &duration, BarSize::OneDay);
      for bar in manager.request_history(request)? {
        println!("{}\tO={} H={} L={} C={} V={}", bar.time, bar.open, bar.high, bar.low, bar.close, bar.volume);
      }
    }
    Command::Details { symbol } => {
      let details = manager.resolve_contract(&Contract::stock(&symbol))?;
      println!("{} ({}) con_id={} min_tick={}", details.contract.symbol, details.long_name,
               details.contract.con_id, details.min_tick);
    }
    Command::Scan { scan_code, rows } => {
      let subscription = ScannerSubscription { scan_code, number_of_rows: rows, ..Default::default() };
      for row in manager.run_scan(subscription, Vec::new())? {
        println!("{}\t{}", row.rank, row.contract_details.contract.symbol);
      }
    }
    Command::Positions => {
      for p in manager.get_positions()? {
        println!("{}\t{}\t{}\t{}", p.account, p.contract.symbol, p.position, p.avg_cost);
      }
    }
    Command::OpenOrders => {
      for o in manager.get_open_orders()? {
        println!("{}\t{} {} {} {}\t{}", o.order_id, o.order.side, o.order.quantity, o.contract.symbol,
                 o.order.order_type, o.state.status);
      }
    }
    Command::Account { tags } => {
      let tags: Vec<&str> = tags.iter().map(|s| s.as_str()).collect();
      let entries = manager.get_account_summary(&tags)?;
      let account = entries.first().map(|e| e.account.clone())
        .ok_or_else(|| anyhow!("Account summary returned no values"))?;
      match TradingMode::from_account_id(&account) {
        TradingMode::Paper => info!("Trading environment: PAPER (account {})", account),
        TradingMode::Live => warn!("Trading environment: LIVE (account {})", account),
      }
      for e in &entries {
        println!("{}\t{}\t{}\t{}", e.account, e.tag, e.value, e.currency);
      }
      if let Some(net) = AccountSummaryEntry::value_for_tag(&entries, "NetLiquidation") {
        println!("Net liquidation: {:.2}", net);
      }
    }
  }
  Ok(())
}

fn main() -> Result<()> {
  env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
  let args = Args::parse();

  let config = load_config(args.config.as_ref())?;
  let session = Arc::new(MockSession::from_script(&args.script)
    .with_context(|| format!("Loading script {:?}", args.script))?);
  let manager = ConnectionManager::new(config, session).context("Failed to create connection manager")?;

  manager.connect().context("Failed to connect")?;
  let result = run(&manager, args.command);
  manager.disconnect();
  result
}
