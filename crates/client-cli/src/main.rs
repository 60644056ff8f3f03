use anyhow::Result;
use clap::{Parser, Subcommand};
use shared::{Frequency, Record};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod artifacts;
mod auth;
mod config;
mod error;
mod jobs;
mod run;
mod session;
mod store;

use api::{ApiClient, DEFAULT_LOG_LIMIT};
use auth::{AuthService, SupabaseAuth};
use config::Config;
use error::ClientError;
use jobs::{JobDraft, JobRegistry};
use run::{RunOrchestrator, RunOutcome, RunStatus};
use session::{PendingProfiles, SignUpForm};
use store::{FileStore, KeyValueStore};

/// Preview rows printed after a run
const PREVIEW_ROWS: usize = 10;

#[derive(Parser)]
#[command(name = "multiagent")]
#[command(about = "Ask questions of your database through the MultiAgent analysis service")]
#[command(version = env!("MULTIAGENT_VERSION"))]
struct Cli {
    /// Analysis service URL (overrides config)
    #[arg(long, global = true)]
    server: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Check that the analysis service is up
    Health,
    /// Sample the configured table through the service
    TestConnection,
    /// Run an analysis and show the results
    Run {
        /// Question to ask (defaults to a sample query)
        question: Option<String>,
        /// Save every artifact into this directory
        #[arg(long)]
        download: Option<PathBuf>,
    },
    /// Show recent service log entries
    Logs {
        #[arg(long, default_value_t = DEFAULT_LOG_LIMIT)]
        limit: usize,
    },
    /// Manage scheduled analyses
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },
    /// Create an account
    SignUp {
        email: String,
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: String,
        /// Repeat the password
        #[arg(long)]
        confirm: String,
    },
    /// Sign in with email and password
    SignIn {
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Sign out and forget the stored session
    SignOut,
    /// Show the signed-in account
    Whoami,
    /// Email a password reset link
    ResetPassword { email: String },
    /// Finish a confirmation or password reset link from your email
    AuthCallback {
        /// The full link, including anything after `#`
        url: String,
    },
    /// Change the password of the signed-in account
    UpdatePassword {
        #[arg(long)]
        password: String,
        #[arg(long)]
        confirm: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Set a configuration value
    Set {
        /// Configuration key (see `config show`)
        key: String,
        /// Configuration value
        value: String,
    },
    /// Get a configuration value
    Get {
        /// Configuration key
        key: String,
    },
    /// Show all configuration
    Show,
    /// Get the config file path
    Path,
}

#[derive(Subcommand)]
enum JobsAction {
    /// List scheduled jobs
    List,
    /// Schedule a recurring analysis
    Add {
        question: String,
        #[arg(long, default_value = "daily")]
        frequency: Frequency,
        /// HH:MM, 24h
        #[arg(long, default_value = "09:00")]
        time: String,
    },
    /// Delete a scheduled job
    Delete { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "multiagent=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    if let Commands::Config { action } = &cli.command {
        return handle_config_command(action);
    }

    let command = cli.command;
    let mut config = Config::load()?;
    if let Some(server) = cli.server {
        config.service.base_url = server;
    }

    let file_store = FileStore::in_dir(Config::data_dir()?);
    tracing::debug!("Key-value store at {}", file_store.path().display());
    let store: Arc<dyn KeyValueStore> = Arc::new(file_store);
    let auth = match SupabaseAuth::new(&config.auth, store.clone()) {
        Ok(auth) => Some(auth),
        Err(e) => {
            tracing::debug!("Auth disabled: {}", e);
            None
        }
    };

    // Profile writes deferred from sign-up happen on whichever command first sees the session
    let reconciler = match &auth {
        Some(auth) => {
            Some(session::spawn_reconciler(auth, auth.profiles(), PendingProfiles::new(store.clone())).await)
        }
        None => None,
    };

    let result: Result<()> = async {
        match command {
            Commands::Config { .. } => Ok(()),
            Commands::Health => health(&config).await,
            Commands::TestConnection => test_connection(&config).await,
            Commands::Run { question, download } => {
                run_analysis(&config, question.as_deref().unwrap_or_default(), download).await
            }
            Commands::Logs { limit } => logs(&config, limit).await,
            Commands::Jobs { action } => handle_jobs_command(&config, action).await,
            Commands::SignUp {
                email,
                username,
                password,
                confirm,
            } => {
                let form = SignUpForm {
                    email,
                    username,
                    password,
                    confirm,
                };
                sign_up(require_auth(&auth)?, store.clone(), &form).await
            }
            Commands::SignIn { email, password } => sign_in(require_auth(&auth)?, &email, &password).await,
            Commands::SignOut => {
                require_auth(&auth)?.sign_out().await?;
                println!("Signed out");
                Ok(())
            }
            Commands::Whoami => whoami(require_auth(&auth)?).await,
            Commands::ResetPassword { email } => {
                let auth = require_auth(&auth)?;
                if let Err(e) = auth.request_password_reset(&email).await {
                    tracing::warn!("Password reset request failed: {}", e);
                }
                // Same answer whether or not the address has an account
                println!("If an account exists for {}, a reset link is on its way.", email.trim());
                println!("Open it with '\x1b[1mmultiagent auth-callback <link>\x1b[0m' to continue.");
                Ok(())
            }
            Commands::AuthCallback { url } => auth_callback(require_auth(&auth)?, &url).await,
            Commands::UpdatePassword { password, confirm } => {
                shared::require_password(&password, &confirm)?;
                require_auth(&auth)?.update_password(&password).await?;
                println!("\x1b[32m✓ Password updated\x1b[0m");
                Ok(())
            }
        }
    }
    .await;

    // Dropping the client closes the session channel so the reconciler drains and exits
    drop(auth);
    if let Some(task) = reconciler {
        if let Err(e) = task.await {
            tracing::warn!("Session reconciler stopped unexpectedly: {}", e);
        }
    }

    result
}

fn require_auth(auth: &Option<SupabaseAuth>) -> Result<&SupabaseAuth> {
    auth.as_ref().ok_or_else(|| {
        anyhow::anyhow!(
            "Auth is not configured. Run 'multiagent config set auth_url <url>' and 'multiagent config set anon_key <key>'"
        )
    })
}

/// Print a client error the way the web form would show it.
fn report(err: ClientError) -> anyhow::Error {
    if err.is_validation() {
        eprintln!("\x1b[33m{}\x1b[0m", err);
    } else {
        eprintln!("\x1b[31m✗ {}\x1b[0m", err);
    }
    err.into()
}

async fn health(config: &Config) -> Result<()> {
    let api = ApiClient::new(&config.service.base_url);
    match api.health().await {
        Ok(res) => {
            println!("\x1b[32m● {}\x1b[0m {}", res.status, api.base_url());
            Ok(())
        }
        Err(e) => {
            println!("\x1b[31m● unreachable\x1b[0m {} ({})", api.base_url(), e);
            Err(e.into())
        }
    }
}

async fn test_connection(config: &Config) -> Result<()> {
    let orchestrator = RunOrchestrator::new(ApiClient::new(&config.service.base_url), &config.service.base_url);
    let rows = orchestrator
        .test_connection(&config.connection)
        .await
        .map_err(report)?;
    println!("\x1b[32m✓ Connection OK\x1b[0m ({} sample rows from {})", rows, config.connection.table.trim());
    Ok(())
}

async fn run_analysis(config: &Config, question: &str, download: Option<PathBuf>) -> Result<()> {
    let api = ApiClient::new(&config.service.base_url);
    let http = api.http().clone();
    let orchestrator = RunOrchestrator::new(api, &config.service.base_url);

    let mut updates = orchestrator.subscribe();
    let progress = tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            if updates.borrow_and_update().status == RunStatus::Running {
                eprintln!("\x1b[90mRunning analysis...\x1b[0m");
            }
        }
    });

    let outcome = orchestrator
        .submit_run(question, &config.connection, &config.email)
        .await
        .map_err(|e| report(e.into()));
    let artifact_urls = orchestrator.artifact_urls();
    drop(orchestrator);
    let _ = progress.await;

    let state = match outcome? {
        RunOutcome::Completed(state) => state,
        RunOutcome::Superseded => return Ok(()),
    };

    match state.status {
        RunStatus::Success => println!("\x1b[32m✓ Run complete\x1b[0m"),
        _ => {
            let message = state.error.as_deref().unwrap_or(run::SERVICE_ERROR_MESSAGE);
            eprintln!("\x1b[31m✗ Run failed: {}\x1b[0m", message);
        }
    }
    if let Some(run_id) = &state.run_id {
        println!("run id: {}", run_id);
    }

    print_preview(&state.preview);

    if !artifact_urls.is_empty() {
        println!();
        println!("\x1b[1mArtifacts\x1b[0m");
        for (name, url) in &artifact_urls {
            println!("  {:<16} {}", name, url);
        }
    }

    if let Some(dir) = download {
        for (name, url) in &artifact_urls {
            match artifacts::download(&http, url, &dir, None).await {
                Ok(path) => println!("\x1b[32m↓\x1b[0m {} -> {}", name, path.display()),
                Err(e) => eprintln!("\x1b[33m! Could not download {}: {}\x1b[0m", name, e),
            }
        }
    }

    if state.status == RunStatus::Error {
        anyhow::bail!("run failed");
    }
    Ok(())
}

fn print_preview(rows: &[Record]) {
    if rows.is_empty() {
        return;
    }
    println!();
    println!("\x1b[1mPreview\x1b[0m ({} rows)", rows.len());
    for row in rows.iter().take(PREVIEW_ROWS) {
        let line = row
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("  ");
        println!("  {}", line);
    }
    if rows.len() > PREVIEW_ROWS {
        println!("  \x1b[90m... {} more\x1b[0m", rows.len() - PREVIEW_ROWS);
    }
}

async fn logs(config: &Config, limit: usize) -> Result<()> {
    let api = ApiClient::new(&config.service.base_url);
    let res = api.logs(limit).await?;
    if res.logs.is_empty() {
        println!("No log entries");
    }
    for entry in &res.logs {
        println!("{}", serde_json::to_string(entry)?);
    }
    Ok(())
}

async fn handle_jobs_command(config: &Config, action: JobsAction) -> Result<()> {
    let mut registry = JobRegistry::new(ApiClient::new(&config.service.base_url));
    match action {
        JobsAction::List => {
            registry.refresh().await.map_err(report)?;
        }
        JobsAction::Add {
            question,
            frequency,
            time,
        } => {
            let mut draft = JobDraft {
                question,
                frequency,
                time,
            };
            let id = registry
                .add_job(&mut draft, &config.connection, &config.email)
                .await
                .map_err(report)?;
            println!("\x1b[32m✓ Scheduled job {}\x1b[0m", id);
        }
        JobsAction::Delete { id } => {
            registry.delete_job(&id).await.map_err(report)?;
            println!("\x1b[32m✓ Deleted job {}\x1b[0m", id);
        }
    }

    if registry.jobs().is_empty() {
        println!("No scheduled jobs");
        return Ok(());
    }
    for job in registry.jobs() {
        let next = job
            .next_run_at()
            .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<12} {:<8} {}  next {}  [{}]  {}",
            job.id,
            job.frequency,
            job.time,
            next,
            job.table().unwrap_or("-"),
            job.question
        );
    }
    Ok(())
}

async fn sign_up(auth: &SupabaseAuth, store: Arc<dyn KeyValueStore>, form: &SignUpForm) -> Result<()> {
    let pending = PendingProfiles::new(store);
    let res = session::sign_up(auth, &pending, form).await?;
    if res.session.is_some() {
        println!("\x1b[32m✓ Account created and signed in\x1b[0m");
    } else {
        let email = res.email.as_deref().unwrap_or(form.email.trim());
        println!("\x1b[32m✓ Check your email to confirm your account\x1b[0m ({})", email);
    }
    Ok(())
}

async fn sign_in(auth: &SupabaseAuth, email: &str, password: &str) -> Result<()> {
    let session = auth.sign_in(email, password).await?;
    println!("\x1b[32m✓ Signed in as {}\x1b[0m", session.display_name());
    Ok(())
}

async fn auth_callback(auth: &SupabaseAuth, url: &str) -> Result<()> {
    let link = auth.complete_link(url).await?;
    println!("\x1b[32m✓ Signed in as {}\x1b[0m", link.session.display_name());
    if link.is_recovery() {
        println!(
            "Choose a new password with '\x1b[1mmultiagent update-password --password <new> --confirm <new>\x1b[0m'."
        );
    }
    Ok(())
}

async fn whoami(auth: &SupabaseAuth) -> Result<()> {
    match auth.get_session().await? {
        Some(session) => {
            println!("\x1b[1m[{}]\x1b[0m {}", session.initials(), session.display_name());
            if let Some(email) = &session.email {
                println!("email: {}", email);
            }
            println!("user id: {}", session.user_id);
        }
        None => {
            eprintln!("\x1b[33m🔐 Not signed in.\x1b[0m");
            eprintln!("   Run '\x1b[1mmultiagent sign-in <email> --password <password>\x1b[0m' to authenticate.");
        }
    }
    Ok(())
}

fn handle_config_command(action: &ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Set { key, value } => {
            let mut config = Config::load_file()?;
            config.set(key, value.clone())?;
            config.save()?;
            println!("Configuration saved");
        }
        ConfigAction::Get { key } => {
            let config = Config::load()?;
            println!("{}", config.get(key)?);
        }
        ConfigAction::Show => {
            let config = Config::load()?;
            for key in config::KEYS {
                println!("{}: {}", key, config.get(key)?);
            }
        }
        ConfigAction::Path => {
            let path = Config::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}
