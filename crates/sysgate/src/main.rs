//! sysgate - account and session administration for the sysgate auth core

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use rand::distributions::{Alphanumeric, DistString};
use rand::rngs::OsRng;
use std::path::Path;
use std::sync::Arc;
use sysgate_auth::{
    AccessGate, Authenticator, Capability, CreateUser, CredentialStore, Decision, HashCodec,
    SessionRegistry, SessionSigner, SystemClock, spawn_sweep_task,
};
use sysgate_db::{Database, UserStatus};
use tokio::task::JoinHandle;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod config;

use config::Config;

/// Length of generated seed passwords
const SEED_PASSWORD_LEN: usize = 20;

/// sysgate - credential and session administration
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/default.toml", env = "SYSGATE_CONFIG")]
    config: String,

    /// Database file, overriding the configuration
    #[arg(long, env = "SYSGATE_DATABASE")]
    database: Option<String>,

    /// Secret for signing session handles
    #[arg(long, env = "SYSGATE_TOKEN_SECRET", hide_env_values = true)]
    token_secret: Option<String>,

    /// Password hashing pepper
    #[arg(long, env = "SYSGATE_PEPPER", hide_env_values = true)]
    pepper: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the schema and seed the admin and test users on an empty database
    Init {
        /// Password for `admin` (generated if omitted)
        #[arg(long, env = "SYSGATE_ADMIN_PASSWORD", hide_env_values = true)]
        admin_password: Option<String>,
        /// Password for `test` (generated if omitted)
        #[arg(long, env = "SYSGATE_TEST_PASSWORD", hide_env_values = true)]
        test_password: Option<String>,
    },
    /// Manage users
    #[command(subcommand)]
    User(UserCommand),
    /// Check credentials and print a session handle
    Login {
        username: String,
        #[arg(long, env = "SYSGATE_PASSWORD", hide_env_values = true)]
        password: String,
        /// Also authorize the new session for this capability
        #[arg(long, value_enum)]
        require: Option<CapabilityArg>,
    },
}

#[derive(Subcommand, Debug)]
enum UserCommand {
    /// Create a user
    Add {
        username: String,
        #[arg(long, env = "SYSGATE_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long)]
        nickname: Option<String>,
        #[arg(long)]
        superuser: bool,
        #[arg(long)]
        staff: bool,
        /// Allow only one active session at a time
        #[arg(long)]
        single_login: bool,
    },
    /// Set a new password, revoking every session of the user
    Passwd {
        username: String,
        #[arg(long, env = "SYSGATE_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Disable a user
    Disable { username: String },
    /// Re-enable a disabled user
    Enable { username: String },
    /// List users
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum CapabilityArg {
    None,
    Staff,
    Superuser,
}

impl From<CapabilityArg> for Capability {
    fn from(arg: CapabilityArg) -> Self {
        match arg {
            CapabilityArg::None => Capability::None,
            CapabilityArg::Staff => Capability::Staff,
            CapabilityArg::Superuser => Capability::Superuser,
        }
    }
}

/// Everything a command needs, wired from configuration
struct Services {
    db: Database,
    auth: Authenticator,
    gate: AccessGate,
    sweeper: JoinHandle<()>,
}

impl Services {
    async fn build(config: &Config) -> Result<Self> {
        config.auth.validate().context("Invalid auth configuration")?;
        if let Some(parent) = Path::new(&config.database.path).parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let db = Database::new(&config.database.url())
            .await
            .context("Failed to open database")?;

        let sessions = Arc::new(SessionRegistry::new(Arc::new(SystemClock)));
        let sweeper = spawn_sweep_task(sessions.clone(), config.auth.sweep_interval());
        let store = CredentialStore::new(Arc::new(db.clone()), sessions);
        let codec = HashCodec::new(&config.hashing).context("Invalid hashing configuration")?;
        let signer = SessionSigner::new(&config.auth.token_secret);

        let auth = Authenticator::new(
            store.clone(),
            codec,
            signer.clone(),
            config.auth.session_ttl(),
        );
        let gate = AccessGate::new(store, signer);

        Ok(Self {
            db,
            auth,
            gate,
            sweeper,
        })
    }

    async fn shutdown(self) {
        self.auth.store().flush().await;
        self.sweeper.abort();
        self.db.close().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)?;
    if let Some(path) = args.database {
        config.database.path = path;
    }
    if let Some(secret) = args.token_secret {
        config.auth.token_secret = secret;
    }
    if let Some(pepper) = args.pepper {
        config.hashing.pepper = Some(pepper);
    }

    init_logging(&config.logging.level, &config.logging.format);
    info!("sysgate v{}", env!("CARGO_PKG_VERSION"));
    config.warn_insecure_defaults();

    let services = Services::build(&config).await?;
    let result = run(&services, args.command).await;
    services.shutdown().await;
    result
}

async fn run(services: &Services, command: Command) -> Result<()> {
    match command {
        Command::Init {
            admin_password,
            test_password,
        } => seed_users(&services.auth, admin_password, test_password).await,
        Command::User(command) => run_user_command(&services.auth, command).await,
        Command::Login {
            username,
            password,
            require,
        } => {
            let issued = services.auth.login(&username, &password).await?;
            println!("session: {}", issued.record.session_id);
            println!("expires: {}", issued.record.expires_at.to_rfc3339());
            println!("handle:  {}", issued.handle);

            if let Some(required) = require {
                let required = Capability::from(required);
                match services.gate.authorize_handle(&issued.handle, required).await? {
                    Decision::Granted(user) => {
                        println!("{}: granted for {}", required.as_str(), user.username)
                    }
                    Decision::Denied(reason) => println!("{}: denied ({})", required.as_str(), reason),
                }
            }
            Ok(())
        }
    }
}

async fn run_user_command(auth: &Authenticator, command: UserCommand) -> Result<()> {
    match command {
        UserCommand::Add {
            username,
            password,
            nickname,
            superuser,
            staff,
            single_login,
        } => {
            let user = auth
                .create_user(CreateUser {
                    username,
                    nickname,
                    password,
                    is_superuser: superuser,
                    is_staff: staff,
                    is_multi_login: !single_login,
                })
                .await?;
            println!("created {} (id {}, uuid {})", user.username, user.id, user.uuid);
        }
        UserCommand::Passwd { username, password } => {
            let record = auth.store().lookup_by_username(&username).await?;
            auth.reset_password(record.user.id, &password).await?;
            println!("password of {} updated", username);
        }
        UserCommand::Disable { username } => {
            let record = auth.store().lookup_by_username(&username).await?;
            auth.store()
                .set_status(record.user.id, UserStatus::Disabled)
                .await?;
            println!("{} disabled", username);
        }
        UserCommand::Enable { username } => {
            let record = auth.store().lookup_by_username(&username).await?;
            auth.store()
                .set_status(record.user.id, UserStatus::Active)
                .await?;
            println!("{} enabled", username);
        }
        UserCommand::List { json } => {
            let users = auth.store().list_users().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&users)?);
            } else {
                println!(
                    "{:<6} {:<20} {:<9} {:<6} {:<6} {:<6} last login",
                    "id", "username", "status", "super", "staff", "multi"
                );
                for user in users {
                    println!(
                        "{:<6} {:<20} {:<9} {:<6} {:<6} {:<6} {}",
                        user.id,
                        user.username,
                        user.status.as_str(),
                        user.is_superuser,
                        user.is_staff,
                        user.is_multi_login,
                        user.last_login_time
                            .map(|t| t.to_rfc3339())
                            .unwrap_or_else(|| "-".to_string())
                    );
                }
            }
        }
    }
    Ok(())
}

/// Create the default `admin` and `test` users if no users exist
async fn seed_users(
    auth: &Authenticator,
    admin_password: Option<String>,
    test_password: Option<String>,
) -> Result<()> {
    if auth.store().has_users().await? {
        info!("Users already present, skipping seed");
        return Ok(());
    }

    let seeds = [
        (
            CreateUser {
                username: "admin".to_string(),
                nickname: Some("admin".to_string()),
                is_superuser: true,
                is_staff: true,
                is_multi_login: true,
                ..Default::default()
            },
            admin_password,
        ),
        (
            CreateUser {
                username: "test".to_string(),
                nickname: Some("test".to_string()),
                ..Default::default()
            },
            test_password,
        ),
    ];

    for (mut request, password) in seeds {
        let generated = password.is_none();
        request.password =
            password.unwrap_or_else(|| Alphanumeric.sample_string(&mut OsRng, SEED_PASSWORD_LEN));
        if request.password.is_empty() {
            bail!("Seed password for {} is empty", request.username);
        }

        let user = auth.create_user(request.clone()).await?;
        info!("Created default user {} (id {})", user.username, user.id);
        if generated {
            println!("{} password: {}", user.username, request.password);
        }
    }
    Ok(())
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);
    if format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}
