use crate::driver::{Driver, DriverFactory};
use crate::sftp_handler::SftpHandler;
use async_trait::async_trait;
use russh::keys::PublicKey;
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Password authentication callback type
pub type PasswordAuthCallback = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Public key authentication callback type
/// Returns true if the given public key is authorized for the user
pub type PubkeyAuthCallback = Arc<dyn Fn(&str, &PublicKey) -> bool + Send + Sync>;

/// Authentication configuration
#[derive(Clone, Default)]
pub struct AuthConfig {
    pub password_callback: Option<PasswordAuthCallback>,
    pub pubkey_callback: Option<PubkeyAuthCallback>,
}

/// SSH server that creates a driver session for each connection
pub struct SshServer<F: DriverFactory> {
    factory: Arc<F>,
    auth_config: AuthConfig,
}

impl<F: DriverFactory> SshServer<F> {
    pub fn new(factory: Arc<F>, auth_config: AuthConfig) -> Self {
        Self {
            factory,
            auth_config,
        }
    }
}

impl<F: DriverFactory> Clone for SshServer<F> {
    fn clone(&self) -> Self {
        Self {
            factory: self.factory.clone(),
            auth_config: self.auth_config.clone(),
        }
    }
}

impl<F: DriverFactory> russh::server::Server for SshServer<F> {
    type Handler = SshSession<F::Driver>;

    fn new_client(&mut self, addr: Option<std::net::SocketAddr>) -> Self::Handler {
        info!(?addr, "New SSH connection");
        let driver = self.factory.new_driver();
        driver.init(addr);
        SshSession::new(Arc::new(driver), self.auth_config.clone())
    }
}

/// Individual SSH session handler
pub struct SshSession<D: Driver> {
    driver: Arc<D>,
    auth_config: AuthConfig,
    channels: Arc<Mutex<HashMap<ChannelId, Channel<Msg>>>>,
}

impl<D: Driver> SshSession<D> {
    pub fn new(driver: Arc<D>, auth_config: AuthConfig) -> Self {
        Self {
            driver,
            auth_config,
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn get_channel(&self, channel_id: ChannelId) -> Option<Channel<Msg>> {
        self.channels.lock().await.remove(&channel_id)
    }
}

fn auth_outcome(user: &str, method: &str, accepted: bool) -> Auth {
    if accepted {
        info!(user, method, "Authentication successful");
        Auth::Accept
    } else {
        info!(user, method, "Authentication failed");
        Auth::Reject {
            proceed_with_methods: None,
        }
    }
}

impl<D: Driver> Drop for SshSession<D> {
    fn drop(&mut self) {
        // Connection gone: stop any storage calls still running for it
        self.driver.abort();
    }
}

#[async_trait]
impl<D: Driver> russh::server::Handler for SshSession<D> {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        debug!(user, "Password authentication attempt");
        let accepted = self
            .auth_config
            .password_callback
            .as_ref()
            .is_some_and(|check| check(user, password));
        Ok(auth_outcome(user, "password", accepted))
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        debug!(user, key_type = ?public_key.algorithm(), "Public key authentication attempt");
        let accepted = self
            .auth_config
            .pubkey_callback
            .as_ref()
            .is_some_and(|check| check(user, public_key));
        Ok(auth_outcome(user, "publickey", accepted))
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(channel_id = ?channel.id(), "Opening session channel");
        self.channels.lock().await.insert(channel.id(), channel);
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(channel_id = ?channel_id, name, "Subsystem request");

        if name == "sftp" {
            if let Some(channel) = self.get_channel(channel_id).await {
                let sftp_handler = SftpHandler::new(self.driver.clone());
                session.channel_success(channel_id)?;

                russh_sftp::server::run(channel.into_stream(), sftp_handler).await;
            }
        } else {
            session.channel_failure(channel_id)?;
        }

        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(channel_id = ?channel_id, "Channel EOF");
        session.close(channel_id)?;
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Other channels of the connection share the driver; it is aborted
        // only when the whole session goes away
        debug!(channel_id = ?channel_id, "Channel closed");
        Ok(())
    }
}
