use std::net::SocketAddr;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "psync", version, about = "Partner Sync Service")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output structured JSON
    #[arg(long, global = true)]
    json: bool,

    /// Partner database path
    #[arg(long, global = true, env = "PSYNC_DB_PATH")]
    db: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP service
    Serve(ServeArgs),
    /// Sync partners from the connected Gmail account
    Sync(SyncArgs),
    /// Manage partner records
    Partners {
        #[command(subcommand)]
        command: PartnerCommands,
    },
    /// Connect or disconnect the Gmail account used by the CLI
    Auth {
        #[command(subcommand)]
        command: AuthCommands,
    },
    /// Show partner database stats
    Stats,
}

#[derive(Debug, Args)]
struct ServeArgs {
    /// Listen address (defaults to PSYNC_BIND)
    #[arg(long)]
    bind: Option<SocketAddr>,
    /// Run without writing results to the partner database
    #[arg(long, default_value_t = false)]
    no_store: bool,
}

#[derive(Debug, Args)]
struct SyncArgs {
    /// Only sync this partner
    #[arg(long)]
    partner: Option<String>,
    /// Scan and classify without writing results back
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum PartnerCommands {
    /// List partners
    List,
    /// Show one partner with its recent emails
    Show { id: String },
    /// Add or replace a partner
    Add {
        id: String,
        name: String,
        #[arg(long)]
        contact: Option<String>,
        #[arg(long)]
        status: Option<String>,
    },
    /// Remove a partner
    Remove { id: String },
}

#[derive(Debug, Subcommand)]
enum AuthCommands {
    /// Print the Google consent URL
    Url,
    /// Exchange an authorization code for tokens
    Exchange { code: String },
    /// Show whether an account is connected
    Status,
    /// Forget stored tokens
    Logout,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Serve(_) => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    commands::dispatch(cli).await
}

mod commands {
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use anyhow::{anyhow, bail, Context, Result};
    use chrono::Utc;
    use reqwest::Client;

    use psync::config::AppConfig;
    use psync::credentials::{CredentialStore, SqliteCredentialStore};
    use psync::db::models::{Partner, PartnerStatus};
    use psync::db::{Database, PartnerStore, SharedDatabase};
    use psync::oauth::{GoogleOAuthClient, OAuthClient, TokenManager};
    use psync::output::{self, OutputFormat};
    use psync::server::{self, AppState};
    use psync::sync::SyncOrchestrator;

    use super::{AuthCommands, Cli, Commands, PartnerCommands};

    pub async fn dispatch(cli: Cli) -> Result<()> {
        let config = AppConfig::from_env().context("load PSYNC_* configuration")?;
        let db_path = resolve_db_path(cli.db.as_deref(), &config)?;
        let format = OutputFormat::from_json_flag(cli.json);

        match cli.command {
            Commands::Serve(args) => handle_serve(config, &db_path, args).await,
            Commands::Sync(args) => handle_sync(config, &db_path, args, format).await,
            Commands::Partners { command } => handle_partners(&db_path, command, format),
            Commands::Auth { command } => handle_auth(config, &db_path, command, cli.json).await,
            Commands::Stats => handle_stats(&db_path, format),
        }
    }

    fn resolve_db_path(flag: Option<&str>, config: &AppConfig) -> Result<PathBuf> {
        match flag.map(PathBuf::from).or_else(|| config.db_path.clone()) {
            Some(path) => Ok(path),
            None => Database::default_db_path().context("resolve default psync database path"),
        }
    }

    fn open_db(db_path: &Path) -> Result<SharedDatabase> {
        let db = Database::open(db_path)
            .with_context(|| format!("open psync database at {}", db_path.display()))?;
        Ok(SharedDatabase::new(db))
    }

    async fn handle_serve(config: AppConfig, db_path: &Path, args: super::ServeArgs) -> Result<()> {
        let addr = args.bind.unwrap_or(config.bind);
        let store = if args.no_store {
            None
        } else {
            Some(open_db(db_path)?)
        };
        server::serve(Arc::new(AppState::new(config, store)), addr).await
    }

    async fn handle_sync(
        config: AppConfig,
        db_path: &Path,
        args: super::SyncArgs,
        format: OutputFormat,
    ) -> Result<()> {
        let db = open_db(db_path)?;
        let http = Client::new();
        let classifier = config.classifier(http.clone())?;
        let oauth = GoogleOAuthClient::new(http.clone(), config.oauth_app()?);
        let credentials = SqliteCredentialStore::new(db.clone(), config.credential_codec());

        let partners = match &args.partner {
            Some(id) => vec![db
                .with(|db| db.get_partner(id))?
                .ok_or_else(|| anyhow!("partner not found for id '{id}'"))?],
            None => db.with(|db| db.list_partners())?,
        };

        let manager = TokenManager::new(
            Arc::new(credentials),
            Arc::new(oauth),
            http,
            config.gmail_api_base.clone(),
        );
        let Some(gmail) = manager.acquire().await else {
            bail!("gmail account not connected; run `psync auth url` then `psync auth exchange <code>`");
        };

        let store = (!args.dry_run).then_some(&db as &dyn PartnerStore);
        let report = SyncOrchestrator::new(&gmail, &classifier, store, config.sync)
            .sync(&partners)
            .await;

        println!("{}", output::format_sync_report(format, &report)?);
        Ok(())
    }

    fn handle_partners(db_path: &Path, command: PartnerCommands, format: OutputFormat) -> Result<()> {
        let db = Database::open(db_path)
            .with_context(|| format!("open psync database at {}", db_path.display()))?;

        match command {
            PartnerCommands::List => {
                let partners = db.list_partners()?;
                println!("{}", output::format_partners(format, &partners)?);
            }
            PartnerCommands::Show { id } => {
                let partner = db
                    .get_partner(&id)?
                    .ok_or_else(|| anyhow!("partner not found for id '{id}'"))?;
                println!("{}", output::format_partner(format, &partner)?);
            }
            PartnerCommands::Add {
                id,
                name,
                contact,
                status,
            } => {
                let mut partner = db
                    .get_partner(&id)?
                    .unwrap_or_else(|| Partner::new(id.as_str(), name.as_str(), ""));
                partner.name = name;
                partner.contact_email = contact.or(partner.contact_email.take());
                if let Some(status) = status {
                    partner.status = status.parse::<PartnerStatus>().map_err(|e| anyhow!(e))?;
                }
                db.upsert_partner(&partner)?;
                println!("saved partner {}", partner.id);
            }
            PartnerCommands::Remove { id } => {
                if db.remove_partner(&id)? == 0 {
                    bail!("partner not found for id '{id}'");
                }
                println!("removed partner {id}");
            }
        }

        Ok(())
    }

    async fn handle_auth(
        config: AppConfig,
        db_path: &Path,
        command: AuthCommands,
        json: bool,
    ) -> Result<()> {
        let db = open_db(db_path)?;
        let store = SqliteCredentialStore::new(db, config.credential_codec());

        match command {
            AuthCommands::Url => {
                let oauth = GoogleOAuthClient::new(Client::new(), config.oauth_app()?);
                println!("{}", oauth.consent_url(None)?);
            }
            AuthCommands::Exchange { code } => {
                let oauth = GoogleOAuthClient::new(Client::new(), config.oauth_app()?);
                let tokens = oauth
                    .exchange_code(code.trim())
                    .await
                    .context("exchange authorization code")?;
                if tokens.refresh_token.is_none() {
                    tracing::warn!("provider returned no refresh token; reconnect with prompt=consent to get one");
                }
                store.save(&tokens.into_pair(Utc::now()))?;
                println!("gmail account connected");
            }
            AuthCommands::Status => {
                let pair = store.load()?;
                if json {
                    let status = serde_json::json!({
                        "connected": pair.is_some(),
                        "hasRefreshToken": pair.as_ref().is_some_and(|p| p.refresh_token.is_some()),
                        "expiry": pair.as_ref().and_then(|p| p.expiry).map(|e| e.to_rfc3339()),
                    });
                    println!("{}", serde_json::to_string_pretty(&status)?);
                } else {
                    match pair {
                        Some(pair) => println!(
                            "connected (refresh token: {}, access token expires: {})",
                            if pair.refresh_token.is_some() { "yes" } else { "no" },
                            pair.expiry
                                .map(|e| e.to_rfc3339())
                                .unwrap_or_else(|| "unknown".to_string())
                        ),
                        None => println!("not connected"),
                    }
                }
            }
            AuthCommands::Logout => {
                store.clear()?;
                println!("gmail credentials removed");
            }
        }

        Ok(())
    }

    fn handle_stats(db_path: &Path, format: OutputFormat) -> Result<()> {
        let db = Database::open(db_path)
            .with_context(|| format!("open psync database at {}", db_path.display()))?;
        let stats = db.get_stats()?;
        println!("{}", output::format_stats(format, &stats)?);
        Ok(())
    }
}
