use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::env;

use crate::payments::providers::daraja::DarajaConfig;
use crate::payments::providers::impala::ImpalaConfig;
use crate::payments::types::ProviderName;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub payment: PaymentConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub environment: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Provider selection plus the credentials for whichever provider is
/// active. Only the selected provider's variables are required.
#[derive(Debug, Clone)]
pub struct PaymentConfig {
    pub provider: ProviderName,
    pub daraja: Option<DarajaConfig>,
    pub impala: Option<ImpalaConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let server = ServerConfig {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
        };

        let database = DatabaseConfig {
            url: env::var("DATABASE_URL").context("DATABASE_URL not set")?,
            max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .context("DATABASE_MAX_CONNECTIONS must be a valid number")?,
        };

        let provider: ProviderName = env::var("PAYMENT_PROVIDER")
            .unwrap_or_else(|_| "impala".to_string())
            .parse()
            .map_err(|e: String| anyhow!(e))?;

        let payment = match provider {
            ProviderName::Daraja => PaymentConfig {
                provider,
                daraja: Some(DarajaConfig::from_env()?),
                impala: ImpalaConfig::from_env().ok(),
            },
            ProviderName::Impala => PaymentConfig {
                provider,
                daraja: DarajaConfig::from_env().ok(),
                impala: Some(ImpalaConfig::from_env()?),
            },
        };

        let config = Config {
            server,
            database,
            payment,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port < 1024 {
            return Err(anyhow!(
                "Port must be at least 1024, got {}",
                self.server.port
            ));
        }

        let valid_environments = ["development", "staging", "production"];
        if !valid_environments.contains(&self.server.environment.as_str()) {
            return Err(anyhow!(
                "Environment must be one of: {:?}, got {}",
                valid_environments,
                self.server.environment
            ));
        }

        if self.database.url.trim().is_empty() {
            return Err(anyhow!("DATABASE_URL cannot be empty"));
        }

        if self.database.max_connections == 0 {
            return Err(anyhow!("DATABASE_MAX_CONNECTIONS must be greater than 0"));
        }

        match self.payment.provider {
            ProviderName::Daraja if self.payment.daraja.is_none() => {
                Err(anyhow!("Daraja selected but not configured"))
            }
            ProviderName::Impala if self.payment.impala.is_none() => {
                Err(anyhow!("Impala Pay selected but not configured"))
            }
            _ => Ok(()),
        }
    }
}
