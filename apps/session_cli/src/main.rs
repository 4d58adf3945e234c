use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use session_core::{
    config::{load_settings, load_settings_from},
    FileSessionStore, HttpUserApi, MemorySessionStore, SessionController, SessionError,
    SessionStore,
};
use shared::{
    domain::{LoginCredentials, NewUser, UserChanges},
    protocol::{RegisterUserDetail, SessionIntent, UpdateUserDetail},
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Settings file; `session.toml` in the working directory by default.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    api_base_url: Option<String>,
    /// File the auth token is kept in between runs.
    #[arg(long)]
    token_path: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    Register {
        #[arg(long)]
        username: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    Update {
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        password: Option<String>,
        #[arg(long)]
        bio: Option<String>,
        #[arg(long)]
        image: Option<String>,
    },
    Whoami,
    Logout,
    /// Sends a raw intent, e.g. '{"type":"getUser","detail":{}}'.
    Intent { json: String },
}

impl Command {
    fn into_intent(self) -> Result<SessionIntent> {
        let intent = match self {
            Command::Login { email, password } => {
                SessionIntent::LoginUser(LoginCredentials { email, password })
            }
            Command::Register {
                username,
                email,
                password,
            } => SessionIntent::RegisterUser(RegisterUserDetail {
                user: Some(NewUser {
                    username,
                    email,
                    password,
                }),
            }),
            Command::Update {
                email,
                username,
                password,
                bio,
                image,
            } => {
                let changes = UserChanges {
                    email,
                    username,
                    password,
                    bio,
                    image,
                };
                if changes.is_empty() {
                    bail!("nothing to update; pass at least one field");
                }
                SessionIntent::UpdateUser(UpdateUserDetail {
                    user: Some(changes),
                })
            }
            Command::Whoami => SessionIntent::GetUser {},
            Command::Logout => SessionIntent::LogoutUser {},
            Command::Intent { json } => SessionIntent::from_json(&json)?,
        };
        Ok(intent)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => load_settings_from(path)?,
        None => load_settings()?,
    };
    if let Some(api_base_url) = args.api_base_url {
        settings.api_base_url = api_base_url;
    }
    if let Some(token_path) = args.token_path {
        settings.token_path = Some(token_path);
    }

    let api = Arc::new(HttpUserApi::new(&settings)?);
    let store: Arc<dyn SessionStore> = match &settings.token_path {
        Some(path) => Arc::new(FileSessionStore::open(path)?),
        None => Arc::new(MemorySessionStore::new()),
    };
    let controller = SessionController::new(api, store);

    let intent = args.command.into_intent()?;
    let name = intent.name();
    debug!(intent = name, base_url = %settings.api_base_url, "dispatching session intent");

    let Some(response) = controller.dispatch(intent) else {
        println!("{name}: ignored (no user in detail)");
        return Ok(());
    };
    let updated = response.updated;

    match response.fetch.await {
        Ok(Some(user)) => {
            if updated {
                eprintln!("profile updated");
            }
            println!("{}", serde_json::to_string_pretty(&user)?);
        }
        Ok(None) => println!("not signed in"),
        Err(SessionError::LoggedOut) => println!("logged out"),
        Err(SessionError::Application(errors)) => {
            for message in errors.messages() {
                eprintln!("{message}");
            }
            bail!("{name} rejected by the backend");
        }
        Err(err) => return Err(err).with_context(|| format!("{name} failed")),
    }

    Ok(())
}
