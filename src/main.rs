//! HR Portal CLI - session management and a live notification listener.
//!
//! This is the main binary entry point. See the `hr_portal` library
//! for the core functionality.

use std::sync::Arc;

use anyhow::Result;
use hr_portal::auth::SignupRequest;
use hr_portal::commands::{self, VERSION};
use hr_portal::keyring::{KeyringTokenStore, TokenStore};
use hr_portal::Config;
use mimalloc::MiMalloc;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;
use clap::{Parser, Subcommand};

// CLI
#[derive(Parser)]
#[command(name = "hr-portal")]
#[command(version = VERSION)]
#[command(about = "HR portal session and notification client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in; the password is read from HR_PORTAL_PASSWORD or stdin
    Login {
        /// Account email
        #[arg(long)]
        email: String,
    },
    /// Create an account and log in
    Signup {
        /// Given name
        #[arg(long)]
        first_name: String,
        /// Family name
        #[arg(long)]
        last_name: String,
        /// Account email
        #[arg(long)]
        email: String,
        /// Department id
        #[arg(long)]
        department_id: i64,
        /// Job title
        #[arg(long)]
        position: String,
        /// Requested role
        #[arg(long)]
        role: Option<String>,
    },
    /// Forget the stored session
    Logout,
    /// Show the logged-in user
    Whoami,
    /// Print live notifications until Ctrl-C
    Listen,
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let environment = hr_portal::env::Environment::current();
    let default_filter = if environment.is_development() { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;
    let storage: Arc<dyn TokenStore> = Arc::new(KeyringTokenStore::new());

    log::debug!("hr-portal v{} ({} environment)", VERSION, environment);

    match cli.command {
        Commands::Login { email } => {
            let password = commands::read_password()?;
            commands::login(&config, storage, &email, &password).await?;
        }
        Commands::Signup {
            first_name,
            last_name,
            email,
            department_id,
            position,
            role,
        } => {
            let password = commands::read_password()?;
            let request = SignupRequest {
                first_name,
                last_name,
                email,
                password,
                department_id,
                position,
                role,
            };
            commands::signup(&config, storage, &request).await?;
        }
        Commands::Logout => commands::logout(&config, storage)?,
        Commands::Whoami => commands::whoami(&config, storage).await?,
        Commands::Listen => commands::listen::run(config, storage).await?,
        Commands::Config => println!("{}", serde_json::to_string_pretty(&config)?),
    }

    Ok(())
}
