use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};

use news_aggregator::config::Config;
use news_aggregator::feed::{FeedDiscoverer, Fetcher, StructureDetector, Synthesizer};
use news_aggregator::storage::{Database, DatabaseError, Project, SourceStatus, WebhookEvent};
use news_aggregator::{Refresher, Subscriber};

/// Get the config directory path (~/.config/news-aggregator/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("news-aggregator"))
}

#[derive(Parser, Debug)]
#[command(
    name = "newsagg",
    about = "Discover, synthesize and aggregate news feeds per project"
)]
struct Cli {
    /// Config file (default: ~/.config/news-aggregator/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// SQLite database file (overrides config and NEWS_AGGREGATOR_DB)
    #[arg(long, global = true, value_name = "FILE")]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage projects
    #[command(subcommand)]
    Project(ProjectCommand),

    /// Manage sources of a project
    #[command(subcommand)]
    Source(SourceCommand),

    /// List feeds discovered for a site (no database access)
    Discover { url: String },

    /// Detect the article structure of a listing page
    Detect { url: String },

    /// Print synthesized RSS for a site without a feed
    Synthesize { url: String },

    /// Refresh sources and store new items
    #[command(subcommand)]
    Refresh(RefreshCommand),

    /// Manage webhooks
    #[command(subcommand)]
    Webhook(WebhookCommand),

    /// Show the latest items of a project
    Items {
        /// Project id or slug
        project: String,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
}

#[derive(Subcommand, Debug)]
enum ProjectCommand {
    Add {
        name: String,
        /// Defaults to the lowercased name with dashes
        #[arg(long)]
        slug: Option<String>,
    },
    List,
}

#[derive(Subcommand, Debug)]
enum SourceCommand {
    /// Add a site: native feed if one is found, otherwise a scraped feed
    Add {
        /// Project id or slug
        project: String,
        url: String,
        #[arg(long)]
        title: Option<String>,
    },
    List {
        /// Project id or slug
        project: String,
    },
    /// Rename a source or pause/resume it
    Edit(SourceEdit),
}

#[derive(Args, Debug)]
struct SourceEdit {
    id: i64,
    #[arg(long)]
    title: Option<String>,
    #[arg(long, value_enum)]
    status: Option<StatusArg>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StatusArg {
    Active,
    Inactive,
}

#[derive(Subcommand, Debug)]
enum RefreshCommand {
    Source { id: i64 },
    Project {
        /// Project id or slug
        project: String,
    },
    All,
}

#[derive(Subcommand, Debug)]
enum WebhookCommand {
    Add {
        /// Project id or slug
        project: String,
        url: String,
        /// HMAC-SHA256 signing secret
        #[arg(long)]
        secret: Option<String>,
        /// Events to subscribe to (default: all)
        #[arg(long = "event", value_enum)]
        events: Vec<EventArg>,
    },
    Deliveries {
        /// Project id or slug
        project: String,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum EventArg {
    #[value(name = "new_items")]
    NewItems,
    #[value(name = "source_refresh")]
    SourceRefresh,
}

impl From<EventArg> for WebhookEvent {
    fn from(arg: EventArg) -> Self {
        match arg {
            EventArg::NewItems => WebhookEvent::NewItems,
            EventArg::SourceRefresh => WebhookEvent::SourceRefresh,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config_dir = get_config_dir()?;
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    let fetcher = Fetcher::new(config.fetch_config()).context("Failed to build HTTP client")?;

    // Commands that only touch the network never open the database
    match &cli.command {
        Command::Discover { url } => {
            let report = FeedDiscoverer::new(fetcher).discover_all_feeds(url).await;
            return print_json(&report);
        }
        Command::Detect { url } => {
            let structure = StructureDetector::new(fetcher)
                .detect_article_structure(url)
                .await
                .with_context(|| format!("No repeating article structure found on {url}"))?;
            return print_json(&structure);
        }
        Command::Synthesize { url } => {
            let xml = Synthesizer::new(fetcher).auto_build_rss(url).await?;
            println!("{xml}");
            return Ok(());
        }
        _ => {}
    }

    let db_path = match &cli.database {
        Some(path) => path.clone(),
        None => {
            ensure_config_dir(&config_dir)?;
            config.resolve_database_path(&config_dir)
        }
    };
    let db = open_database(&db_path).await?;

    match cli.command {
        Command::Project(ProjectCommand::Add { name, slug }) => {
            let slug = slug.unwrap_or_else(|| slugify(&name));
            let project = db.create_project(&name, &slug).await?;
            print_json(&project)?;
        }
        Command::Project(ProjectCommand::List) => {
            print_json(&db.list_projects().await?)?;
        }
        Command::Source(SourceCommand::Add {
            project,
            url,
            title,
        }) => {
            let project = resolve_project(&db, &project).await?;
            let subscriber = Subscriber::new(db.clone(), fetcher, config.synthesis.max_items);
            let source = subscriber
                .add_source(project.id, &url, title.as_deref())
                .await?;
            print_json(&source)?;
        }
        Command::Source(SourceCommand::List { project }) => {
            let project = resolve_project(&db, &project).await?;
            print_json(&db.list_sources(project.id).await?)?;
        }
        Command::Source(SourceCommand::Edit(edit)) => {
            db.find_source(edit.id)
                .await?
                .with_context(|| format!("Source {} not found", edit.id))?;
            if let Some(title) = &edit.title {
                db.set_source_title(edit.id, title).await?;
            }
            if let Some(status) = edit.status {
                let status = match status {
                    StatusArg::Active => SourceStatus::Active,
                    StatusArg::Inactive => SourceStatus::Inactive,
                };
                db.set_source_status(edit.id, status).await?;
            }
            print_json(&db.find_source(edit.id).await?)?;
        }
        Command::Refresh(refresh) => {
            let refresher = Refresher::new(db.clone(), fetcher, config.refresh.max_concurrent);
            match refresh {
                RefreshCommand::Source { id } => {
                    print_json(&refresher.refresh_source(id).await?)?;
                }
                RefreshCommand::Project { project } => {
                    let project = resolve_project(&db, &project).await?;
                    print_json(&refresher.refresh_project(project.id).await?)?;
                }
                RefreshCommand::All => {
                    print_json(&refresher.refresh_all_projects().await?)?;
                }
            }
            refresher.wait_for_webhooks().await;
        }
        Command::Webhook(WebhookCommand::Add {
            project,
            url,
            secret,
            events,
        }) => {
            let project = resolve_project(&db, &project).await?;
            let events: Vec<WebhookEvent> = if events.is_empty() {
                vec![WebhookEvent::NewItems, WebhookEvent::SourceRefresh]
            } else {
                events.into_iter().map(WebhookEvent::from).collect()
            };
            let id = db
                .create_webhook(project.id, &url, secret.as_deref(), &events)
                .await?;
            println!("Created webhook {id} for project {}", project.slug);
        }
        Command::Webhook(WebhookCommand::Deliveries { project, limit }) => {
            let project = resolve_project(&db, &project).await?;
            print_json(&db.list_deliveries(project.id, limit).await?)?;
        }
        Command::Items { project, limit } => {
            let project = resolve_project(&db, &project).await?;
            print_json(&db.list_items(project.id, limit).await?)?;
        }
        Command::Discover { .. } | Command::Detect { .. } | Command::Synthesize { .. } => {}
    }

    Ok(())
}

/// Creates the config directory with user-only permissions.
fn ensure_config_dir(config_dir: &Path) -> Result<()> {
    if !config_dir.exists() {
        std::fs::create_dir_all(config_dir).context("Failed to create config directory")?;
        tracing::info!(path = %config_dir.display(), "Created config directory");
    }

    // Holds the database with webhook secrets
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o700);
        if let Err(e) = std::fs::set_permissions(config_dir, perms) {
            tracing::warn!(
                path = %config_dir.display(),
                error = %e,
                "Failed to set config directory permissions to 0700"
            );
        }
    }
    Ok(())
}

async fn open_database(path: &Path) -> Result<Database> {
    let path_str = path
        .to_str()
        .with_context(|| format!("Database path is not valid UTF-8: {}", path.display()))?;
    match Database::open(path_str).await {
        Ok(db) => Ok(db),
        Err(DatabaseError::InstanceLocked) => {
            anyhow::bail!("{}", DatabaseError::InstanceLocked)
        }
        Err(e) => Err(e).with_context(|| format!("Failed to open database {}", path.display())),
    }
}

/// Looks a project up by numeric id, then by slug.
async fn resolve_project(db: &Database, key: &str) -> Result<Project> {
    if let Ok(id) = key.parse::<i64>() {
        if let Some(project) = db.find_project(id).await? {
            return Ok(project);
        }
    }
    db.find_project_by_slug(key)
        .await?
        .with_context(|| format!("Project {key:?} not found"))
}

fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_alphanumeric() {
            slug.extend(c.to_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_owned()
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{json}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Tech News"), "tech-news");
        assert_eq!(slugify("  Rust & Go!  "), "rust-go");
        assert_eq!(slugify("Ünïcode"), "ünïcode");
    }

    #[test]
    fn test_cli_parses_nested_commands() {
        let cli = Cli::try_parse_from([
            "newsagg",
            "webhook",
            "add",
            "tech",
            "https://hooks.example.com",
            "--event",
            "new_items",
        ])
        .unwrap();
        match cli.command {
            Command::Webhook(WebhookCommand::Add { events, .. }) => {
                assert_eq!(events.len(), 1);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
