//! tornwatch: Torn faction hospital and player activity alerts for Discord.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tornwatch::clock::SystemClock;
use tornwatch::delivery::{
    DeliverySink, DiscordBotSink, DiscordWebhookSink, LogSink, RoutingSink,
};
use tornwatch::source::TornSource;
use tornwatch::watchlist::{JsonFileWatchList, WatchListStore};
use tornwatch::{Destination, EntityId, GroupId, WatchConfig, Watcher, WatcherParts};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(author, version, about = "Torn faction hospital and activity alerts", long_about = None)]
struct Cli {
    /// Config file (defaults to the platform config directory).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log notifications instead of sending them.
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll every watched group and deliver alerts until interrupted (default).
    Run,
    /// Add a faction (or `idle-watch`) to the watch list.
    Watch(WatchArgs),
    /// Remove a group from the watch list.
    Unwatch {
        /// `faction:<id>`, a bare faction id, or `idle-watch`.
        group: GroupId,
    },
    /// Add a player to the idle watch.
    WatchUser { user_id: u64 },
    /// Remove a player from the idle watch.
    UnwatchUser { user_id: u64 },
    /// Print the watch list.
    List,
    /// Poll one group once and print what would be scheduled.
    Poll { group: GroupId },
    /// Write a default config file if none exists.
    InitConfig,
}

#[derive(Args, Debug)]
struct WatchArgs {
    /// `faction:<id>`, a bare faction id, or `idle-watch`.
    group: GroupId,
    /// Discord channel for this group's alerts (needs a bot token).
    #[arg(long, conflicts_with = "webhook")]
    channel: Option<String>,
    /// Discord webhook URL for this group's alerts.
    #[arg(long)]
    webhook: Option<String>,
}

impl WatchArgs {
    fn destination(&self) -> Option<Destination> {
        if let Some(channel_id) = &self.channel {
            return Some(Destination::Channel {
                channel_id: channel_id.clone(),
            });
        }
        self.webhook
            .as_ref()
            .map(|url| Destination::Webhook { url: url.clone() })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(WatchConfig::default_config_path);

    if matches!(cli.command, Some(Command::InitConfig)) {
        return init_config(&config_path);
    }

    let mut config = load_config(&config_path)?;
    config.apply_env_overrides();
    if cli.dry_run {
        config.delivery.dry_run = true;
    }
    let _log_guard = init_tracing(&config);

    let store = JsonFileWatchList::new(config.storage.watch_list_path());
    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config, store).await,
        Command::Poll { group } => poll_once(config, store, group).await,
        Command::Watch(args) => edit_list(&store, |list| {
            if !list.upsert(args.group, args.destination()) {
                println!("{} was already watched; destination updated", args.group);
            }
        }),
        Command::Unwatch { group } => edit_list(&store, |list| {
            if !list.remove(group) {
                println!("{group} was not watched");
            }
            if group == GroupId::IdleWatch {
                list.clear_users();
            }
        }),
        Command::WatchUser { user_id } => edit_list(&store, |list| {
            list.idle_users.insert(EntityId(user_id));
            if !list.contains(GroupId::IdleWatch) {
                list.upsert(GroupId::IdleWatch, None);
            }
        }),
        Command::UnwatchUser { user_id } => edit_list(&store, |list| {
            if !list.remove_user(EntityId(user_id)) {
                println!("user {user_id} was not watched");
            }
        }),
        Command::List => print_list(&store),
        Command::InitConfig => Ok(()),
    }
}

fn load_config(path: &std::path::Path) -> anyhow::Result<WatchConfig> {
    if path.exists() {
        WatchConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))
    } else {
        Ok(WatchConfig::default())
    }
}

fn init_config(path: &std::path::Path) -> anyhow::Result<()> {
    if path.exists() {
        println!("config already exists at {}", path.display());
        return Ok(());
    }
    WatchConfig::default()
        .save_to_file(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("wrote default config to {}", path.display());
    Ok(())
}

/// Stderr logging, plus a daily rolling file when enabled. The returned
/// guard must live until exit so buffered file output is flushed.
fn init_tracing(config: &WatchConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tornwatch=info"));
    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    if config.logging.file {
        let appender =
            tracing_appender::rolling::daily(tornwatch::watch_dirs::logs_dir(), "tornwatch.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .with(fmt::layer().with_ansi(false).with_writer(writer))
            .init();
        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .init();
        None
    }
}

fn build_watcher(config: &WatchConfig, store: JsonFileWatchList) -> anyhow::Result<Watcher> {
    config.validate()?;

    let torn_client =
        tornwatch::http::build_client(Duration::from_secs(config.torn.request_timeout_secs))?;
    let source = TornSource::new(config.torn.api_key.clone(), torn_client)
        .with_base_url(config.torn.base_url.clone());

    let sink: Arc<dyn DeliverySink> = if config.delivery.dry_run {
        tracing::info!("dry run: notifications are logged, not sent");
        Arc::new(LogSink)
    } else {
        let client =
            tornwatch::http::build_client(Duration::from_secs(config.delivery.timeout_secs))?;
        let channels = config
            .delivery
            .bot_token
            .as_ref()
            .filter(|t| !t.trim().is_empty())
            .map(|token| {
                Arc::new(DiscordBotSink::new(token.clone(), client.clone())) as Arc<dyn DeliverySink>
            });
        Arc::new(RoutingSink::new(
            channels,
            Arc::new(DiscordWebhookSink::new(client)),
        ))
    };

    Ok(Watcher::new(
        config,
        WatcherParts {
            source: Arc::new(source),
            sink,
            store: Arc::new(store),
            clock: Arc::new(SystemClock),
        },
    ))
}

async fn run(config: WatchConfig, store: JsonFileWatchList) -> anyhow::Result<()> {
    tracing::info!(watch_list = %store.path().display(), "tornwatch starting");
    let watcher = build_watcher(&config, store)?;
    watcher.start().context("failed to load watch list")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("interrupt received; shutting down");
    let cancelled = watcher.shutdown().await;
    tracing::info!(cancelled, "tornwatch shut down cleanly");
    Ok(())
}

async fn poll_once(
    mut config: WatchConfig,
    store: JsonFileWatchList,
    group: GroupId,
) -> anyhow::Result<()> {
    // No background loops: only the requested poll runs.
    config.hospital.enabled = false;
    config.idle_watch.enabled = false;
    config.delivery.dry_run = true;

    let watcher = build_watcher(&config, store)?;
    watcher.start().context("failed to load watch list")?;
    let result = watcher.force_poll(group).await;
    let pending = watcher.list_pending();
    watcher.shutdown().await;

    let reconciliation = result.with_context(|| format!("poll of {group} failed"))?;
    println!(
        "{group}: {} tracked, {} transitions",
        reconciliation.next_state.len(),
        reconciliation.immediate.len()
    );
    for alert in pending {
        println!(
            "  {} ({}) alert at {} for release at {}",
            alert.label, alert.entity, alert.alert_at, alert.target_time
        );
    }
    Ok(())
}

fn edit_list(
    store: &JsonFileWatchList,
    edit: impl FnOnce(&mut tornwatch::watchlist::WatchList),
) -> anyhow::Result<()> {
    let mut list = store.load()?;
    edit(&mut list);
    store.save(&list)?;
    println!(
        "watch list saved to {} (restart a running watcher to apply)",
        store.path().display()
    );
    Ok(())
}

fn print_list(store: &JsonFileWatchList) -> anyhow::Result<()> {
    let list = store.load()?;
    if list.is_empty() {
        println!("nothing watched");
        return Ok(());
    }
    for watch in &list.groups {
        match &watch.destination {
            Some(destination) => println!("{} -> {destination}", watch.group),
            None => println!("{} -> default", watch.group),
        }
    }
    for user in &list.idle_users {
        println!("idle-watch user {user}");
    }
    Ok(())
}
