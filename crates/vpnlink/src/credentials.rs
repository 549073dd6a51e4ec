//! Credentials provider backed by the agent configuration

use crate::config::AgentConfig;
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::info;
use vpnlink_control::ports::{AccessCredentials, CredentialsError, CredentialsProvider, VpnToken};

/// Fixed tokens read once at startup
pub struct StaticCredentials {
    app_id: String,
    vpn_token: String,
    premium: bool,
    access: AccessCredentials,
    changes: broadcast::Sender<()>,
}

impl StaticCredentials {
    pub fn from_config(config: &AgentConfig) -> Self {
        let c = &config.credentials;
        let (changes, _) = broadcast::channel(4);
        Self {
            app_id: config.app_id.clone(),
            vpn_token: config.vpn_token.clone(),
            premium: config.premium,
            access: AccessCredentials {
                token: c.token.clone(),
                credentials_hash: c.credentials_hash.clone(),
                prefix: c.prefix.clone(),
                username: c.username.clone(),
                password: c.password.clone(),
            },
            changes,
        }
    }
}

#[async_trait]
impl CredentialsProvider for StaticCredentials {
    fn app_id(&self) -> String {
        self.app_id.clone()
    }

    async fn vpn_token(&self) -> Result<VpnToken, CredentialsError> {
        if self.vpn_token.is_empty() {
            return Err(CredentialsError::NoToken);
        }
        Ok(VpnToken {
            token: self.vpn_token.clone(),
            premium: self.premium,
        })
    }

    async fn access_credentials(&self) -> Result<AccessCredentials, CredentialsError> {
        if self.access.token.is_empty() {
            return Err(CredentialsError::NoToken);
        }
        Ok(self.access.clone())
    }

    async fn is_premium_token(&self) -> bool {
        self.premium
    }

    async fn refresh_tokens(&self) -> Result<(), CredentialsError> {
        // Nothing to refresh against; the file is the source of truth
        info!("Token refresh requested, keeping configured tokens");
        let _ = self.changes.send(());
        Ok(())
    }

    fn tokens_changed(&self) -> broadcast::Receiver<()> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AgentConfig {
        let mut config = AgentConfig::default();
        config.vpn_token = "vt".into();
        config.credentials.token = "ct".into();
        config.credentials.prefix = "p1".into();
        config
    }

    #[tokio::test]
    async fn test_serves_configured_tokens() {
        let creds = StaticCredentials::from_config(&config());

        let token = creds.vpn_token().await.unwrap();
        assert_eq!(token.token, "vt");
        assert!(!token.premium);
        assert_eq!(creds.access_credentials().await.unwrap().prefix, "p1");
        assert!(!creds.is_premium_token().await);

        let mut premium = config();
        premium.premium = true;
        let creds = StaticCredentials::from_config(&premium);
        assert!(creds.vpn_token().await.unwrap().premium);
    }

    #[tokio::test]
    async fn test_missing_tokens() {
        let creds = StaticCredentials::from_config(&AgentConfig::default());

        assert!(matches!(creds.vpn_token().await, Err(CredentialsError::NoToken)));
        assert!(matches!(creds.access_credentials().await, Err(CredentialsError::NoToken)));
        assert!(creds.refresh_tokens().await.is_ok());
    }

    #[tokio::test]
    async fn test_refresh_signals_tokens_changed() {
        let creds = StaticCredentials::from_config(&config());
        let mut changes = creds.tokens_changed();

        creds.refresh_tokens().await.unwrap();

        assert!(changes.try_recv().is_ok());
        assert!(changes.try_recv().is_err());
    }
}
