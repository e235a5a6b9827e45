//! SFTP server over flat object storage (S3 or in-memory)

use clap::{Parser, Subcommand};
use objftp::{MarkerObjects, MemoryStore, ObjectStore, Server, ServerConfig, SessionFactory};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "objftp")]
#[command(about = "SFTP server over flat object storage", long_about = None)]
struct Cli {
    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value = "2222")]
    port: u16,

    /// Path to host key file (OpenSSH format)
    #[arg(long, env = "HOST_KEY_FILE")]
    host_key_file: Option<PathBuf>,

    /// Host key data (PEM/OpenSSH format, alternative to --host-key-file)
    #[arg(long, env = "HOST_KEY", hide = true)]
    host_key: Option<String>,

    /// User credentials (user:password format, can be repeated)
    #[arg(short, long = "user", env = "SFTP_USERS", value_delimiter = ',')]
    users: Vec<String>,

    /// Path to authorized_keys file for public key auth
    #[arg(long, env = "AUTHORIZED_KEYS_FILE")]
    authorized_keys_file: Option<PathBuf>,

    /// Authorized public keys (OpenSSH format, newline-separated)
    #[arg(long, env = "AUTHORIZED_KEYS", hide = true)]
    authorized_keys: Option<String>,

    /// Welcome message shown to clients before login
    #[arg(long, env = "WELCOME_MESSAGE", default_value = "")]
    welcome: String,

    /// Back created directories with `.keep` marker objects so they outlive the session
    #[arg(long, env = "PERSIST_FOLDERS")]
    persist_folders: bool,

    #[command(subcommand)]
    storage: StorageCommand,
}

#[derive(Subcommand)]
enum StorageCommand {
    /// Serve objects from an S3 bucket
    #[cfg(feature = "s3")]
    S3 {
        /// S3 bucket name
        #[arg(env = "S3_BUCKET")]
        bucket: String,

        /// S3 key prefix (optional)
        #[arg(long, env = "S3_PREFIX", default_value = "")]
        prefix: String,

        /// S3 endpoint URL (for S3-compatible services)
        #[arg(long, env = "S3_ENDPOINT")]
        endpoint: Option<String>,

        /// AWS region
        #[arg(long, env = "AWS_REGION", default_value = "us-east-1")]
        region: String,

        /// Also delete old versions and delete markers when removing a file
        #[arg(long, env = "S3_PURGE_VERSIONS")]
        purge_versions: bool,
    },
    /// Use in-memory storage (for testing)
    Memory,
}

/// Parse an OpenSSH public key line
fn parse_pubkey(line: &str) -> Option<russh::keys::PublicKey> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 2 {
        return None;
    }
    russh::keys::parse_public_key_base64(parts[1]).ok()
}

/// Load authorized keys from file or string
fn load_authorized_keys(
    file: Option<&PathBuf>,
    data: Option<&str>,
) -> objftp::Result<Vec<russh::keys::PublicKey>> {
    let contents = if let Some(path) = file {
        std::fs::read_to_string(path).map_err(|e| {
            objftp::Error::Config(format!("could not read {}: {}", path.display(), e))
        })?
    } else if let Some(data) = data {
        data.to_string()
    } else {
        return Ok(Vec::new());
    };

    Ok(contents.lines().filter_map(parse_pubkey).collect())
}

/// Parse user:password credentials
fn parse_users(users: &[String]) -> Vec<(String, String)> {
    users
        .iter()
        .filter_map(|s| {
            let (user, pass) = s.split_once(':')?;
            Some((user.to_string(), pass.to_string()))
        })
        .collect()
}

async fn build_store(command: StorageCommand) -> Box<dyn ObjectStore> {
    match command {
        #[cfg(feature = "s3")]
        StorageCommand::S3 {
            bucket,
            prefix,
            endpoint,
            region,
            purge_versions,
        } => {
            info!(bucket = %bucket, prefix = %prefix, "Storage: S3");
            let s3_config = objftp::S3Config::new(&bucket)
                .with_prefix(&prefix)
                .with_purge_versions(purge_versions);
            match endpoint {
                Some(endpoint) => {
                    info!(endpoint = %endpoint, "Using custom S3 endpoint");
                    Box::new(objftp::S3Store::with_endpoint(s3_config, &endpoint, &region).await)
                }
                None => Box::new(objftp::S3Store::from_env(s3_config).await),
            }
        }
        StorageCommand::Memory => {
            warn!("Storage: in-memory (data will be lost on exit)");
            Box::new(MemoryStore::new())
        }
    }
}

#[tokio::main]
async fn main() -> objftp::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let directive = "objftp=info"
        .parse()
        .map_err(|e| objftp::Error::Config(format!("invalid log directive: {}", e)))?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive))
        .init();

    // Build server config
    let mut config = ServerConfig::new().port(cli.port).banner(cli.welcome);

    // Load host key
    if let Some(ref path) = cli.host_key_file {
        config = config.with_key_file(path)?;
        info!(path = %path.display(), "Loaded host key");
    } else if let Some(ref data) = cli.host_key {
        config = config.with_key_data(data)?;
        info!("Loaded host key from HOST_KEY env var");
    } else {
        config = config.with_generated_key()?;
        warn!("Using generated host key (clients will see key change warnings)");
        warn!("Set HOST_KEY_FILE or HOST_KEY for persistent keys");
    }

    // Parse credentials
    let users = parse_users(&cli.users);
    let authorized_keys = load_authorized_keys(
        cli.authorized_keys_file.as_ref(),
        cli.authorized_keys.as_deref(),
    )?;

    if users.is_empty() && authorized_keys.is_empty() {
        warn!("No authentication configured! Use --user user:pass or --authorized-keys-file path");
    }

    if !authorized_keys.is_empty() {
        info!(count = authorized_keys.len(), "Loaded authorized public keys");
    }

    let store = build_store(cli.storage).await;
    let shutdown = CancellationToken::new();
    let mut factory = SessionFactory::from_arc(store.into()).with_shutdown(shutdown.clone());
    if cli.persist_folders {
        info!("Directories are persisted as .keep marker objects");
        factory = factory.with_persistence(MarkerObjects);
    }

    let mut server = Server::new(factory).config(config);

    if !users.is_empty() {
        server = server.with_users(users);
    }
    if !authorized_keys.is_empty() {
        server = server.with_pubkey_auth(move |_user, key| authorized_keys.iter().any(|k| k == key));
    }

    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down, cancelling open sessions");
            shutdown.cancel();
            Ok(())
        }
    }
}
