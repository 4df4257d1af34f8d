//! newsrelay CLI — operator interface to the publish queue.

use clap::{Parser, Subcommand};
use newsrelay::config::Config;
use newsrelay::driver::DryRunDriver;
use newsrelay::model::{PostId, Status};
use newsrelay::store::Store;
use newsrelay::worker::{PublishWorker, WorkerConfig};

#[derive(Parser)]
#[command(name = "newsrelay", about = "Durable publish queue for short news items")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the publish worker loop
    Serve,
    /// Post operations
    Post {
        #[command(subcommand)]
        action: PostAction,
    },
}

#[derive(Subcommand)]
enum PostAction {
    /// Enqueue raw text for publication
    Enqueue {
        /// The text to publish (markup allowed; sanitized before delivery)
        text: String,
        /// Also clear it for publication immediately
        #[arg(long)]
        approve: bool,
    },
    /// Clear a pending post for publication
    Approve {
        /// Post ID
        id: i64,
    },
    /// List posts
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<String>,
        /// Maximum posts to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show a post
    Show {
        /// Post ID
        id: i64,
    },
    /// Dump the audit event stream
    Events {
        /// Only events after this sequence number
        #[arg(long, default_value_t = 0)]
        since: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;
    init_tracing(&config.log_level)?;

    let store = Store::open(&config.db_path)?;

    match cli.command {
        Command::Serve => cmd_serve(store, &config).await,
        Command::Post { action } => match action {
            PostAction::Enqueue { text, approve } => cmd_enqueue(&store, &text, approve),
            PostAction::Approve { id } => {
                store.approve(PostId(id))?;
                println!("Approved: {id}");
                Ok(())
            }
            PostAction::List { status, limit } => cmd_list(&store, status, limit),
            PostAction::Show { id } => cmd_show(&store, PostId(id)),
            PostAction::Events { since } => cmd_events(&store, since),
        },
    }
}

fn init_tracing(default_level: &str) -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to init tracing subscriber: {e}"))?;
    Ok(())
}

async fn cmd_serve(store: Store, config: &Config) -> anyhow::Result<()> {
    let worker = PublishWorker::new(
        store,
        DryRunDriver,
        WorkerConfig {
            poll_interval: config.poll_interval,
            delivery_timeout: config.delivery_timeout,
            claim_batch: config.claim_batch,
        },
    );

    let stop = worker.stop_signal();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        stop.stop();
    });

    worker.run().await?;
    Ok(())
}

fn cmd_enqueue(store: &Store, text: &str, approve: bool) -> anyhow::Result<()> {
    match store.enqueue(text)? {
        Some(id) => {
            if approve {
                store.approve(id)?;
            }
            println!(
                "Enqueued: {id}{}",
                if approve { " (approved)" } else { "" }
            );
        }
        None => println!("Suppressed: identical text is pending or was sent recently"),
    }
    Ok(())
}

fn cmd_list(store: &Store, status: Option<String>, limit: i64) -> anyhow::Result<()> {
    let status_filter: Option<Status> = match status {
        Some(s) => Some(
            s.parse()
                .map_err(|_| anyhow::anyhow!("invalid status: {s}"))?,
        ),
        None => None,
    };

    let items = store.list(status_filter, limit)?;
    if items.is_empty() {
        println!("No posts found.");
        return Ok(());
    }

    println!(
        "{:<6}  {:<10}  {:<8}  {:<8}  {:<19}  TEXT",
        "ID", "STATUS", "APPROVED", "ATTEMPTS", "CREATED"
    );
    println!("{}", "-".repeat(100));

    for item in &items {
        let mut preview: String = item.canon.chars().take(40).collect();
        if item.canon.chars().count() > 40 {
            preview.push('…');
        }
        println!(
            "{:<6}  {:<10}  {:<8}  {:<8}  {:<19}  {}",
            item.id.to_string(),
            item.status.to_string(),
            if item.approved { "yes" } else { "no" },
            item.attempts,
            item.created_at.format("%Y-%m-%d %H:%M:%S"),
            preview
        );
    }

    println!("\n{} post(s)", items.len());
    Ok(())
}

fn cmd_show(store: &Store, id: PostId) -> anyhow::Result<()> {
    let item = store.get(id)?;

    println!("ID:          {}", item.id);
    println!("Status:      {}", item.status);
    println!("Approved:    {}", if item.approved { "yes" } else { "no" });
    println!("Attempts:    {}", item.attempts);
    println!("Created:     {}", item.created_at);
    if let Some(sent) = item.sent_at {
        println!("Sent:        {sent}");
    }
    if let Some(next_try) = item.next_try_at {
        println!("Next try:    {next_try}");
    }
    println!("---");
    println!("Text:        {}", item.text);
    println!("Canonical:   {}", item.canon);
    Ok(())
}

fn cmd_events(store: &Store, since: u64) -> anyhow::Result<()> {
    let events = store.events_since(since)?;
    for event in &events {
        println!("{}", serde_json::to_string(event)?);
    }
    if events.is_empty() {
        println!("No events after seq {since}.");
    }
    Ok(())
}
