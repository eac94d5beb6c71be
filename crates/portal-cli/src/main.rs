//! CLI entry point for Portal.
//!
//! This binary provides the `portal` command: sign in against the
//! configured identity provider, inspect the session, and call the
//! protected API and profile endpoint with the acquired tokens.

mod config;

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use portal_api::{ApiClient, AuthorizedRequestDispatcher, Profile, ProfileClient};
use portal_auth::{
    Account, AccountStore, AuthSessionController, BootContext, BootReport, InteractionMode,
    LoginOutcome, OidcProvider, ScopeRequest, ScopeSet, SessionState, TokenAcquisitionEngine,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::PortalConfig;

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// Portal: sign in and call protected APIs from the terminal.
#[derive(Parser)]
#[command(
    name = "portal",
    version,
    about = "Sign in with OpenID Connect and call protected APIs",
    long_about = "Signs the user in against an OpenID Connect authority, keeps delegated \
                  access tokens in a local session cache, and calls protected resources \
                  with them."
)]
struct Cli {
    /// Configuration file; missing files fall back to defaults.
    #[arg(long, global = true, default_value = "config/portal.toml")]
    config: PathBuf,

    /// Log level used when `RUST_LOG` is not set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Log line format written to stderr.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    /// Human-readable single lines.
    Compact,
    /// One JSON object per event, for log shippers.
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the session state and signed-in accounts.
    Status,

    /// Sign in interactively.
    Login {
        /// `popup` (browser + local callback) or `redirect`.
        #[arg(long, default_value = "popup")]
        mode: InteractionMode,
    },

    /// Finish a redirect sign-in with the URL the browser landed on.
    CompleteRedirect {
        /// Full callback URL, including `code` and `state`.
        url: String,
    },

    /// Sign out every account and clear the session cache.
    Logout,

    /// Call the protected API's `/hello` endpoint.
    Hello,

    /// Show the signed-in user's profile.
    Profile,

    /// Print an access token for the given scopes.
    Token {
        /// Scopes to request; defaults to the API scope.
        #[arg(long = "scope")]
        scopes: Vec<String>,

        /// Interactive surface to use if the user must be asked.
        #[arg(long, default_value = "popup")]
        mode: InteractionMode,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_format);

    if let Err(err) = run(cli).await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = PortalConfig::load(&cli.config)?;

    let boot = match &cli.command {
        Commands::CompleteRedirect { url } => BootContext::with_callback(url.clone()),
        _ => BootContext::default(),
    };
    let app = App::start(&config, boot).await?;

    match cli.command {
        Commands::Status => app.cmd_status(),
        Commands::Login { mode } => app.cmd_login(mode).await,
        Commands::CompleteRedirect { .. } => app.cmd_status(),
        Commands::Logout => app.cmd_logout().await,
        Commands::Hello => app.cmd_hello().await,
        Commands::Profile => app.cmd_profile().await,
        Commands::Token { scopes, mode } => app.cmd_token(scopes, mode).await,
    }
}

// ---------------------------------------------------------------------------
// Application wiring
// ---------------------------------------------------------------------------

struct App {
    session: Arc<AuthSessionController>,
    api: ApiClient,
    profile: ProfileClient,
    api_scope: String,
}

impl App {
    async fn start(config: &PortalConfig, boot: BootContext) -> Result<Self> {
        let oidc = config.oidc()?;
        let login_scopes = oidc.login_scopes.clone();
        let boot = BootContext {
            redirect_timeout: std::time::Duration::from_secs(oidc.redirect_timeout_secs),
            ..boot
        };

        let store = Arc::new(
            AccountStore::open(config.cache_location()).context("failed to open session cache")?,
        );
        let provider = Arc::new(OidcProvider::new(oidc, Arc::clone(&store))?);
        let engine = TokenAcquisitionEngine::new(store, provider);

        let (session, report) = AuthSessionController::boot(engine, login_scopes, boot).await?;
        report_boot(&report);

        let session = Arc::new(session);
        let dispatcher = AuthorizedRequestDispatcher::new(Arc::clone(&session));
        info!(state = %session.session_state(), "session ready");

        Ok(Self {
            api: ApiClient::new(dispatcher.clone(), config.api.clone()),
            profile: ProfileClient::new(dispatcher, &config.api),
            api_scope: config.api.api_scope.clone(),
            session,
        })
    }

    // -- Subcommands --------------------------------------------------------

    fn cmd_status(&self) -> Result<()> {
        let state = self.session.session_state();
        println!("Session: {state}");

        let active = self.session.active_account()?;
        for account in self.session.current_accounts()? {
            let marker = if active.as_ref().is_some_and(|a| a.id == account.id) {
                "*"
            } else {
                " "
            };
            println!("{marker} {} <{}>", account.greeting_name(), account.username);
        }

        match (state, active) {
            (SessionState::Authenticated, Some(account)) => {
                println!("Welcome, {}!", account.greeting_name());
            }
            (SessionState::Unauthenticated, _) => println!("Run `portal login` to sign in."),
            _ => {}
        }
        Ok(())
    }

    async fn cmd_login(&self, mode: InteractionMode) -> Result<()> {
        if mode == InteractionMode::Popup {
            println!("Complete sign-in in your browser; the URL is in the log output.");
        }
        match self.session.login(mode).await? {
            LoginOutcome::SignedIn(account) => {
                println!("Welcome, {}!", account.greeting_name());
            }
            LoginOutcome::Redirecting { authorization_url } => {
                println!("Open this URL to sign in:\n\n  {authorization_url}\n");
                println!("Then run `portal complete-redirect '<url the browser landed on>'`.");
            }
            LoginOutcome::AlreadyInProgress => {
                println!("A sign-in is already in progress.");
            }
        }
        Ok(())
    }

    async fn cmd_logout(&self) -> Result<()> {
        let outcome = self.session.logout().await?;
        println!("Signed out.");
        if let Some(url) = outcome.end_session_url {
            println!("To end the provider session, open:\n\n  {url}");
        }
        Ok(())
    }

    async fn cmd_hello(&self) -> Result<()> {
        let body = self.api.hello().await?;
        match body.get("message").and_then(|m| m.as_str()) {
            Some(message) => println!("{message}"),
            None => println!("{}", serde_json::to_string_pretty(&body)?),
        }
        Ok(())
    }

    async fn cmd_profile(&self) -> Result<()> {
        let profile = self.profile.me().await?;
        let account = self.session.active_account()?;
        print!("{}", render_profile(account.as_ref(), &profile)?);
        Ok(())
    }

    async fn cmd_token(&self, scopes: Vec<String>, mode: InteractionMode) -> Result<()> {
        let scopes = if scopes.is_empty() {
            ScopeSet::parse(&self.api_scope)
        } else {
            ScopeSet::new(scopes)
        };
        let request = ScopeRequest::new(scopes).with_interaction(mode);
        let token = self.session.acquire_token(&request).await.into_result()?;

        let output = serde_json::json!({
            "access_token": token.access_token,
            "token_type": token.token_type,
            "scopes": token.scopes,
            "expires_at": token.expires_at.to_rfc3339(),
            "account": token.account_id.to_string(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Output helpers
// ---------------------------------------------------------------------------

fn report_boot(report: &BootReport) {
    if let Some(account) = &report.redirect_account {
        println!("Signed in as {} <{}>.", account.greeting_name(), account.username);
    }
    if let Some(err) = &report.redirect_error {
        eprintln!("error: {err}");
    }
    if report.discarded_stale_redirect {
        eprintln!("A previous redirect sign-in expired and was discarded.");
    }
}

/// Account details, directory profile, and ID-token claims as printed by
/// `portal profile`.
fn render_profile(account: Option<&Account>, profile: &Profile) -> Result<String> {
    let field = |value: Option<&str>| value.unwrap_or("Not specified").to_string();
    let mut out = String::new();

    writeln!(out, "Account Information")?;
    match account {
        Some(account) => {
            writeln!(out, "  Name:            {}", field(account.display_name.as_deref()))?;
            writeln!(out, "  Username:        {}", account.username)?;
            writeln!(out, "  Environment:     {}", account.environment)?;
        }
        None => writeln!(out, "  No active account")?,
    }

    writeln!(out, "\nProfile")?;
    writeln!(out, "  Name:            {}", field(profile.display_name.as_deref()))?;
    writeln!(out, "  Email:           {}", field(profile.email()))?;
    writeln!(out, "  Job Title:       {}", field(profile.job_title.as_deref()))?;
    writeln!(out, "  Office Location: {}", field(profile.office_location.as_deref()))?;

    if let Some(account) = account {
        writeln!(out, "\nID Token Claims")?;
        if account.claims.is_empty() {
            writeln!(out, "  (none)")?;
        } else {
            for line in serde_json::to_string_pretty(&account.claims)?.lines() {
                writeln!(out, "  {line}")?;
            }
        }
    }
    Ok(out)
}

/// Initialize the tracing subscriber with the given default log level.
fn init_tracing(default_level: &str, format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    match format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
