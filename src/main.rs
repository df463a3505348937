use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use parlor_server::{load_config, ServerConfig};
use parlor_store::{ChatStore, SqliteChatStore};
use parlor_telemetry::init_telemetry;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "parlor", about = "Real-time chat gateway", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the WebSocket server.
    Serve {
        /// JSON config file. Environment variables override it.
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        port: Option<u16>,
    },
    /// Create a user account.
    AddUser {
        #[arg(long)]
        login: String,

        #[arg(long)]
        name: String,

        #[arg(long)]
        password: String,

        /// Defaults to the configured database path.
        #[arg(long)]
        database: Option<PathBuf>,
    },
    /// Print the login key a client can use with `auth_by_key`.
    UserKey {
        #[arg(long)]
        password: String,

        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config, port } => serve(config, port).await,
        Command::AddUser {
            login,
            name,
            password,
            database,
        } => add_user(&login, &name, &password, database).await,
        Command::UserKey { password, config } => {
            let config = load_config(config.as_deref())?;
            if config.uses_default_secret() {
                eprintln!("warning: using the default auth_secret; this key is not private");
            }
            println!("{}", config.auth_secret.user_key(&password));
            Ok(())
        }
    }
}

async fn serve(config_path: Option<PathBuf>, port: Option<u16>) -> anyhow::Result<()> {
    let mut config = load_config(config_path.as_deref()).context("failed to load config")?;
    if let Some(port) = port {
        config.port = port;
    }
    let _ = init_telemetry(&config.telemetry());

    let store = open_store(&config)?;
    let handle = parlor_server::start(config, store)
        .await
        .context("failed to start server")?;
    info!(addr = %handle.local_addr(), "parlor ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;
    info!("shutting down");
    handle.shutdown().await;
    Ok(())
}

async fn add_user(
    login: &str,
    name: &str,
    password: &str,
    database: Option<PathBuf>,
) -> anyhow::Result<()> {
    let mut config = load_config(None)?;
    if let Some(path) = database {
        config.database_path = path;
    }
    let _ = init_telemetry(&config.telemetry());

    let store = open_store(&config)?;
    let user = store
        .create_user(name, login, password)
        .await
        .with_context(|| format!("failed to create user {login}"))?;
    println!("created user {} ({})", user.id, user.login);
    Ok(())
}

fn open_store(config: &ServerConfig) -> anyhow::Result<Arc<dyn ChatStore>> {
    let store = SqliteChatStore::open(&config.database_path).with_context(|| {
        format!("failed to open database {}", config.database_path.display())
    })?;
    info!(path = %config.database_path.display(), "database opened");
    Ok(Arc::new(store))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_serve() {
        let cli = Cli::parse_from(["parlor", "serve", "--port", "9000"]);
        match cli.command {
            Command::Serve { config, port } => {
                assert!(config.is_none());
                assert_eq!(port, Some(9000));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_add_user() {
        let cli = Cli::parse_from([
            "parlor", "add-user", "--login", "ann", "--name", "Ann", "--password", "pw",
        ]);
        match cli.command {
            Command::AddUser { login, name, password, database } => {
                assert_eq!(login, "ann");
                assert_eq!(name, "Ann");
                assert_eq!(password, "pw");
                assert!(database.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn add_user_requires_login() {
        assert!(Cli::try_parse_from(["parlor", "add-user", "--name", "Ann", "--password", "pw"]).is_err());
    }
}
