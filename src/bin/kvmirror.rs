use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};
use kvmirror::{ConfigCache, Settings, ValueKind, Wait};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "kvmirror", about = "Inspect and edit mirrored configuration", version)]
struct Args {
  #[arg(long, env = "KVMIRROR_REDIS_HOST")]
  redis_host: Option<String>,
  #[arg(long, env = "KVMIRROR_REDIS_PORT")]
  redis_port: Option<u16>,
  #[arg(long, env = "KVMIRROR_HEAD")]
  head: Option<String>,
  #[arg(long, env = "KVMIRROR_PUBLISHER")]
  publisher: Option<String>,
  #[arg(short, long)]
  config: Option<String>,
  #[arg(long)]
  log_level: Option<String>,
  /// Seconds to wait for a value
  #[arg(long, default_value_t = 5)]
  wait: u64,
  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Print a value
  Get {
    name: String,
    /// Decode as bool, char, double, integer, string or string-array
    #[arg(short, long)]
    kind: Option<ValueKind>,
  },
  /// Write a value
  Set {
    name: String,
    value: String,
    #[arg(short, long, default_value = "string")]
    kind: ValueKind,
  },
  /// Print every update of the given names until interrupted
  Watch { names: Vec<String> },
  /// List the presets of a family
  Presets { family: String },
  /// Show cache statistics after the initial load
  Stats,
}

fn main() -> Result<(), anyhow::Error> {
  let args = Args::parse();

  let mut settings = if let Some(path) = &args.config {
    Settings::from_file(path)?
  } else {
    Settings::find_and_load()?.unwrap_or_default()
  };

  if let Some(host) = args.redis_host {
    settings.redis.host = host;
  }
  if let Some(port) = args.redis_port {
    settings.redis.port = port;
  }
  if let Some(head) = args.head {
    settings.cache.head = Some(head);
  }
  if let Some(publisher) = args.publisher {
    settings.cache.publisher = Some(publisher);
  }
  if let Some(level) = args.log_level {
    settings.logging.level = level;
  }
  // The CLI only needs its own keys; skip the heartbeat
  settings.status.heartbeat_key.clear();

  tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| settings.logging.level.clone().into()),
    )
    .with(tracing_subscriber::fmt::layer())
    .init();

  let wait = Wait::Timeout(Duration::from_secs(args.wait));
  let cache = ConfigCache::connect(settings)?;

  match args.command {
    Command::Get { name, kind } => match kind {
      Some(kind) => {
        let value = cache.get(&name, kind, wait)?;
        println!("{}", serde_json::to_string(&value)?);
      }
      None => println!("{}", cache.get_raw(&name, wait)?),
    },
    Command::Set { name, value, kind } => {
      let value = kvmirror::Value::decode(kind, &value)
        .ok_or_else(|| anyhow::anyhow!("{:?} is not a valid {}", value, kind))?;
      cache.set(&name, value)?;
    }
    Command::Watch { names } => {
      for name in &names {
        let label = name.clone();
        cache.on_change(name, move |raw| println!("{} = {}", label, raw))?;
      }
      loop {
        std::thread::sleep(Duration::from_secs(1));
      }
    }
    Command::Presets { family } => {
      let mut table = Table::new();
      table
        .load_preset(UTF8_FULL)
        .set_header(vec!["#", "name", "position"]);
      for preset in cache.presets(&family)? {
        table.add_row(vec![
          preset.slot.to_string(),
          preset.name.clone(),
          preset.position.to_string(),
        ]);
      }
      println!("{table}");
    }
    Command::Stats => {
      cache.wait_ready(Duration::from_secs(args.wait));
      let stats = cache.stats();
      let mut table = Table::new();
      table.load_preset(UTF8_FULL).set_header(vec!["stat", "value"]);
      table.add_row(vec!["keys".to_string(), stats.keys.to_string()]);
      table.add_row(vec![
        "synced".to_string(),
        format!("{} ({:.0}%)", stats.synced, stats.synced_ratio() * 100.0),
      ]);
      table.add_row(vec!["fetches".to_string(), stats.fetches.to_string()]);
      table.add_row(vec!["writes".to_string(), stats.writes.to_string()]);
      table.add_row(vec!["reconnects".to_string(), stats.reconnects.to_string()]);
      println!("{table}");
    }
  }

  cache.shutdown();
  Ok(())
}
