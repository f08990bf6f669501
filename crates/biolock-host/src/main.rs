use anyhow::{anyhow, Context, Result};
use biolock_core::biometrics::platform_gate;
use biolock_core::driver;
use biolock_core::paths::settings_path;
use biolock_core::secret_store::{KeyringSecretStore, SecretStore};
use biolock_core::{Broker, HostSettings};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

const LOG_ENV: &str = "BIOLOCK_LOG";
const SECRET_ENV: &str = "BIOLOCK_SECRET";

#[derive(Parser, Debug)]
#[command(author, version, about = "Biometric unlock native messaging host", long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// Settings file (defaults to BIOLOCK_CONFIG or the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,

    /// Arguments the browser passes when spawning the host
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    caller: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Store the unlock key for a user in the OS credential vault
    StoreSecret {
        #[arg(long)]
        user_id: String,
    },
    /// Remove a user's unlock key from the OS credential vault
    DeleteSecret {
        #[arg(long)]
        user_id: String,
    },
    /// Run the biometric prompt once and print the decision
    CheckBiometrics,
}

enum Outcome {
    Disconnected,
    Interrupted,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(cli.config.as_deref())?;
    init_logging(&settings);

    match cli.command {
        None => match serve(&settings, &cli.caller).await {
            Ok(Outcome::Disconnected) => Ok(()),
            Ok(Outcome::Interrupted) => std::process::exit(130),
            Err(e) => {
                error!("host stopped: {e:#}");
                Err(e)
            }
        },
        Some(Commands::StoreSecret { user_id }) => store_secret_command(&settings, &user_id),
        Some(Commands::DeleteSecret { user_id }) => delete_secret_command(&settings, &user_id),
        Some(Commands::CheckBiometrics) => check_biometrics_command(&settings).await,
    }
}

fn load_settings(override_path: Option<&std::path::Path>) -> Result<HostSettings> {
    let path = match override_path {
        Some(p) => p.to_path_buf(),
        None => settings_path()?,
    };
    HostSettings::load(&path).with_context(|| format!("loading {}", path.display()))
}

/// stdout carries protocol frames, so logs always go to stderr.
fn init_logging(settings: &HostSettings) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(&settings.log_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

async fn serve(settings: &HostSettings, caller: &[String]) -> Result<Outcome> {
    info!(caller = ?caller, "host starting");
    let store: Arc<dyn SecretStore> = Arc::new(KeyringSecretStore::new(&settings.secret_service));
    let mut broker = Broker::from_settings(settings, platform_gate(settings), store);

    let outcome = tokio::select! {
        res = driver::run(tokio::io::stdin(), tokio::io::stdout(), &mut broker, settings) => {
            res?;
            Outcome::Disconnected
        }
        res = signal::ctrl_c() => {
            res?;
            warn!("interrupted; abandoning pending request");
            Outcome::Interrupted
        }
    };
    // Dropping the broker wipes the transport key.
    drop(broker);
    info!("host stopping");
    Ok(outcome)
}

fn store_secret_command(settings: &HostSettings, user_id: &str) -> Result<()> {
    let secret = read_secret()?;
    KeyringSecretStore::new(&settings.secret_service).set_secret(user_id, &secret)?;
    println!("Stored unlock key for {user_id}");
    Ok(())
}

fn delete_secret_command(settings: &HostSettings, user_id: &str) -> Result<()> {
    KeyringSecretStore::new(&settings.secret_service).delete_secret(user_id)?;
    println!("Deleted unlock key for {user_id}");
    Ok(())
}

async fn check_biometrics_command(settings: &HostSettings) -> Result<()> {
    let gate = platform_gate(settings);
    if gate.check_biometrics().await {
        println!("authorized");
        Ok(())
    } else {
        Err(anyhow!("not authorized"))
    }
}

fn read_secret() -> Result<Zeroizing<String>> {
    if let Ok(secret) = std::env::var(SECRET_ENV) {
        if !secret.is_empty() {
            return Ok(Zeroizing::new(secret));
        }
    }
    let secret = rpassword::prompt_password("Unlock key (base64): ")
        .map_err(|e| anyhow!("secret prompt: {e}"))?;
    if secret.trim().is_empty() {
        return Err(anyhow!("empty secret"));
    }
    Ok(Zeroizing::new(secret.trim().to_string()))
}
