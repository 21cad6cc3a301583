//! Context configuration.

use std::time::Duration;

use crate::error::{Error, Result};

/// Environment variable selecting the domain.
pub const DOMAIN_ID_ENV: &str = "ROS_DOMAIN_ID";

/// Configuration for a [`Context`](crate::Context).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Domain to discover and communicate in.
    pub domain_id: usize,
    /// Security enclave announced by every node.
    pub enclave: String,
    /// Timeout for client queries. `None` waits indefinitely.
    pub query_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            domain_id: 0,
            enclave: "/".to_string(),
            query_timeout: None,
        }
    }
}

impl Config {
    /// Default configuration with the domain taken from `ROS_DOMAIN_ID`.
    ///
    /// An unset or blank variable keeps the default domain.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(raw) = lookup(DOMAIN_ID_ENV) {
            let trimmed = raw.trim();
            if !trimmed.is_empty() {
                config.domain_id = trimmed
                    .parse()
                    .map_err(|e| Error::config(format!("invalid {DOMAIN_ID_ENV} `{raw}`: {e}")))?;
            }
        }
        Ok(config)
    }

    /// Set the domain.
    pub fn with_domain_id(mut self, domain_id: usize) -> Self {
        self.domain_id = domain_id;
        self
    }

    /// Set the enclave.
    pub fn with_enclave(mut self, enclave: impl Into<String>) -> Self {
        self.enclave = enclave.into();
        self
    }

    /// Set the client query timeout.
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = Some(timeout);
        self
    }

    /// Check the configuration for values the token format cannot carry.
    pub fn validate(&self) -> Result<()> {
        if !self.enclave.starts_with('/') {
            return Err(Error::config(format!(
                "enclave `{}` must be absolute",
                self.enclave
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(value: Option<&'static str>) -> impl Fn(&str) -> Option<String> {
        move |key: &str| {
            assert_eq!(key, DOMAIN_ID_ENV);
            value.map(str::to_string)
        }
    }

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.domain_id, 0);
        assert_eq!(config.enclave, "/");
        assert_eq!(config.query_timeout, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn domain_from_env() {
        assert_eq!(Config::from_lookup(env(Some(" 42 "))).unwrap().domain_id, 42);
        assert_eq!(Config::from_lookup(env(Some(""))).unwrap().domain_id, 0);
        assert_eq!(Config::from_lookup(env(None)).unwrap().domain_id, 0);
        assert!(matches!(
            Config::from_lookup(env(Some("abc"))),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn builders_and_validation() {
        let config = Config::default()
            .with_domain_id(3)
            .with_enclave("relative")
            .with_query_timeout(Duration::from_secs(1));
        assert_eq!(config.domain_id, 3);
        assert_eq!(config.query_timeout, Some(Duration::from_secs(1)));
        assert!(config.validate().is_err());
    }
}
