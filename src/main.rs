use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use graceful_query::api::types::{ItemFilters, NewItem};
use graceful_query::{logging, Config, DataSession, HttpExecutor, MutationError, QueryResult};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "gq")]
#[command(about = "Read and mutate backend data through a resilient cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/gq/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Backend base URL, overriding the config file
  #[arg(long)]
  base_url: Option<String>,

  /// Debug logging for the data layer
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Backend health
  Health,
  /// User profile
  Profile { id: String },
  /// Wallet balance
  Wallet { id: String },
  /// Wallet transactions
  Transactions { id: String },
  /// Merits of a user
  Merits { id: String },
  /// Marketplace listing
  Items {
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    search: Option<String>,
    #[arg(long)]
    max_price: Option<u32>,
  },
  /// Page of the social feed
  Posts {
    #[arg(long, default_value_t = 1)]
    page: u32,
    #[arg(long, default_value_t = 20)]
    limit: u32,
  },
  /// Single post
  Post { id: String },
  /// Comments of a post
  Comments {
    post_id: String,
    #[arg(long, default_value_t = 1)]
    page: u32,
  },
  /// Video catalogue
  Videos,
  /// Video categories
  Categories,
  /// Playlists
  Playlists,
  /// Like or unlike a post
  Like { post_id: String },
  /// Publish a post
  Publish {
    content: String,
    #[arg(long)]
    post_type: Option<String>,
  },
  /// Comment on a post
  Comment { post_id: String, content: String },
  /// Award merits to a user
  Award {
    user_id: String,
    merit_type: String,
    amount: i64,
    #[arg(long)]
    description: Option<String>,
  },
  /// List an item on the marketplace
  Sell {
    title: String,
    price: f64,
    #[arg(long)]
    category: Option<String>,
  },
  /// Remove a marketplace item
  Unlist { id: String },
  /// Show what the cache holds after hydration
  Cache,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Override base URL if specified on command line
  let config = if let Some(base_url) = args.base_url {
    let mut config = config;
    config.api.base_url = base_url;
    config
  } else {
    config
  };

  let _log_guard = logging::init(&config.log, args.verbose)?;

  let executor = HttpExecutor::new(&config.api.base_url, config.api.timeout(), Config::api_token())?;
  let session = DataSession::start(&config, Arc::new(executor))?;

  let outcome = run(&session, args.command).await;
  session.shutdown()?;
  outcome
}

async fn run(session: &DataSession, command: Command) -> Result<()> {
  let client = session.client();

  match command {
    Command::Health => print_read(client.health().await),
    Command::Profile { id } => print_read(client.user_profile(&id).await),
    Command::Wallet { id } => print_read(client.wallet_balance(&id).await),
    Command::Transactions { id } => print_read(client.wallet_transactions(&id).await),
    Command::Merits { id } => print_read(client.merits(&id).await),
    Command::Items {
      category,
      search,
      max_price,
    } => print_read(
      client
        .marketplace_items(ItemFilters {
          category,
          search,
          max_price,
        })
        .await,
    ),
    Command::Posts { page, limit } => print_read(client.posts(page, limit).await),
    Command::Post { id } => print_read(client.post(&id).await),
    Command::Comments { post_id, page } => print_read(client.comments(&post_id, page).await),
    Command::Videos => print_read(client.video_items().await),
    Command::Categories => print_read(client.video_categories().await),
    Command::Playlists => print_read(client.playlists().await),
    Command::Like { post_id } => print_mutation(client.toggle_like(&post_id).await),
    Command::Publish { content, post_type } => {
      print_mutation(client.create_post(&content, post_type, None).await)
    }
    Command::Comment { post_id, content } => {
      print_mutation(client.create_comment(&post_id, &content).await)
    }
    Command::Award {
      user_id,
      merit_type,
      amount,
      description,
    } => print_mutation(
      client
        .award_merit(&user_id, &merit_type, amount, description)
        .await,
    ),
    Command::Sell {
      title,
      price,
      category,
    } => print_mutation(
      client
        .create_item(NewItem {
          title,
          price,
          category,
          description: None,
        })
        .await,
    ),
    Command::Unlist { id } => print_mutation(client.delete_item(&id).await),
    Command::Cache => {
      for entry in session.store().snapshot() {
        println!("{:<48} {:<12} {}", entry.key.to_string(), entry.tier.name(), entry.status.name());
      }
      Ok(())
    }
  }
}

fn print_read<T: Serialize>(result: QueryResult<T>) -> Result<()> {
  if let Some(data) = &result.data {
    print_json(data)?;
  }
  match result.error {
    Some(error) if result.is_error => Err(eyre!("Read failed ({}): {}", result.status.name(), error)),
    _ => Ok(()),
  }
}

fn print_mutation(result: Result<Value, MutationError>) -> Result<()> {
  let value = result.map_err(|e| eyre!("{} rejected: {}", e.mutation, e.reason()))?;
  if !value.is_null() {
    print_json(&value)?;
  }
  Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  let text = serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to encode output: {}", e))?;
  println!("{}", text);
  Ok(())
}
