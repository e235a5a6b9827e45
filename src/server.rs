use crate::driver::DriverFactory;
use crate::ssh_handler::{AuthConfig, SshServer};
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::PublicKey;
use russh::server::{Config as SshConfig, Server as _};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Server configuration
#[derive(Clone)]
pub struct ServerConfig {
    /// Port to bind to
    pub port: u16,
    /// SSH server keys
    pub keys: Vec<russh::keys::PrivateKey>,
    /// Authentication rejection time
    pub auth_rejection_time: Duration,
    /// Banner shown to clients before authentication
    pub banner: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 2222,
            keys: Vec::new(),
            auth_rejection_time: Duration::from_secs(3),
            banner: None,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Greet clients with `banner` before they authenticate
    pub fn banner(mut self, banner: impl Into<String>) -> Self {
        let banner = banner.into();
        self.banner = (!banner.is_empty()).then_some(banner);
        self
    }

    pub fn with_key(mut self, key: russh::keys::PrivateKey) -> Self {
        self.keys.push(key);
        self
    }

    /// Generate a random Ed25519 key (useful for testing/development)
    pub fn with_generated_key(mut self) -> crate::Result<Self> {
        let key = russh::keys::PrivateKey::random(&mut OsRng, russh::keys::Algorithm::Ed25519)?;
        self.keys.push(key);
        Ok(self)
    }

    /// Load a host key from a file (OpenSSH format)
    pub fn with_key_file(mut self, path: impl AsRef<Path>) -> Result<Self, russh::keys::Error> {
        let key = russh::keys::load_secret_key(path, None)?;
        self.keys.push(key);
        Ok(self)
    }

    /// Load a host key from PEM/OpenSSH format string data
    pub fn with_key_data(mut self, data: &str) -> Result<Self, russh::keys::Error> {
        let key = russh::keys::decode_secret_key(data, None)?;
        self.keys.push(key);
        Ok(self)
    }
}

/// SFTP front end over a driver factory
pub struct Server<F: DriverFactory> {
    factory: Arc<F>,
    config: ServerConfig,
    auth_config: AuthConfig,
}

impl<F: DriverFactory> Server<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory: Arc::new(factory),
            config: ServerConfig::default(),
            auth_config: AuthConfig::default(),
        }
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set password authentication callback
    pub fn with_password_auth<C>(mut self, callback: C) -> Self
    where
        C: Fn(&str, &str) -> bool + Send + Sync + 'static,
    {
        self.auth_config.password_callback = Some(Arc::new(callback));
        self
    }

    /// Set public key authentication callback
    pub fn with_pubkey_auth<C>(mut self, callback: C) -> Self
    where
        C: Fn(&str, &PublicKey) -> bool + Send + Sync + 'static,
    {
        self.auth_config.pubkey_callback = Some(Arc::new(callback));
        self
    }

    /// Set static users for password authentication
    pub fn with_users(self, users: Vec<(String, String)>) -> Self {
        let users = Arc::new(users);
        self.with_password_auth(move |user, pass| users.iter().any(|(u, p)| u == user && p == pass))
    }

    /// Run the server
    pub async fn run(self) -> crate::Result<()> {
        let mut keys = self.config.keys.clone();
        if keys.is_empty() {
            keys.push(russh::keys::PrivateKey::random(
                &mut OsRng,
                russh::keys::Algorithm::Ed25519,
            )?);
        }

        // Determine which auth methods to advertise
        let mut methods = russh::MethodSet::empty();
        if self.auth_config.password_callback.is_some() {
            methods |= russh::MethodSet::PASSWORD;
        }
        if self.auth_config.pubkey_callback.is_some() {
            methods |= russh::MethodSet::PUBLICKEY;
        }
        // Default to password if nothing configured
        if methods.is_empty() {
            methods = russh::MethodSet::PASSWORD;
        }

        // The server runs until the process exits, so the banner is leaked once
        let auth_banner = self
            .config
            .banner
            .map(|banner| -> &'static str { Box::leak(banner.into_boxed_str()) });

        let ssh_config = SshConfig {
            auth_banner,
            auth_rejection_time: self.config.auth_rejection_time,
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            methods,
            keys,
            ..Default::default()
        };

        let ssh_config = Arc::new(ssh_config);
        let mut server = SshServer::new(self.factory, self.auth_config);

        info!(port = self.config.port, "Starting SFTP server");

        server
            .run_on_address(ssh_config, ("0.0.0.0", self.config.port))
            .await?;

        Ok(())
    }
}

// Re-export auth types for advanced usage
pub use crate::ssh_handler::{PasswordAuthCallback, PubkeyAuthCallback};
