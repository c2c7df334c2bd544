//! Configuration for the exchange manager and its HTTP transport

use crate::retry::RetryConfig;
use crate::{Error, Result};
use std::env;

/// Environment variable holding the backend base URL
pub const BASE_URL_ENV: &str = "CHAT_EXCHANGE_BASE_URL";

/// Environment variable holding the bearer token issued by the auth store
pub const AUTH_TOKEN_ENV: &str = "CHAT_EXCHANGE_AUTH_TOKEN";

/// Default path of the "send chat message" endpoint
pub const DEFAULT_ENDPOINT: &str = "/chat/message";

/// Settings shared by every exchange a manager runs.
#[derive(Clone)]
pub struct ExchangeConfig {
    /// Backend base URL, e.g. `http://localhost:5001/api`
    pub base_url: String,

    /// Path of the chat endpoint appended to `base_url`
    pub endpoint: String,

    /// Whole-request deadline in seconds, including streamed bodies
    pub timeout: u64,

    /// Bearer token supplied by the authentication collaborator
    pub auth_token: Option<String>,

    /// Assistant-mode instruction forwarded with every request
    pub system_prompt: Option<String>,

    /// Forward prior completed turns as `history`
    pub include_history: bool,

    /// Retry policy for opening the call; `None` disables retries
    pub retry: Option<RetryConfig>,

    /// Capacity of the progress event channel
    pub event_capacity: usize,
}

impl std::fmt::Debug for ExchangeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeConfig")
            .field("base_url", &self.base_url)
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "***"))
            .field("system_prompt", &self.system_prompt)
            .field("include_history", &self.include_history)
            .field("retry", &self.retry)
            .field("event_capacity", &self.event_capacity)
            .finish()
    }
}

impl ExchangeConfig {
    pub fn builder() -> ExchangeConfigBuilder {
        ExchangeConfigBuilder::default()
    }

    /// Builds a config from `CHAT_EXCHANGE_BASE_URL` and
    /// `CHAT_EXCHANGE_AUTH_TOKEN`.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use chat_exchange::ExchangeConfig;
    ///
    /// let config = ExchangeConfig::from_env()?;
    /// # Ok::<(), chat_exchange::Error>(())
    /// ```
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base_url = lookup(BASE_URL_ENV)
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| Error::config(format!("{} is not set", BASE_URL_ENV)))?;

        let mut builder = Self::builder().base_url(base_url);
        if let Some(token) = lookup(AUTH_TOKEN_ENV).filter(|t| !t.is_empty()) {
            builder = builder.auth_token(token);
        }
        builder.build()
    }

    /// Full URL of the chat endpoint.
    pub fn endpoint_url(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.endpoint.trim_start_matches('/')
        )
    }
}

#[derive(Debug, Default)]
pub struct ExchangeConfigBuilder {
    base_url: Option<String>,
    endpoint: Option<String>,
    timeout: Option<u64>,
    auth_token: Option<String>,
    system_prompt: Option<String>,
    include_history: Option<bool>,
    retry: Option<RetryConfig>,
    event_capacity: Option<usize>,
}

impl ExchangeConfigBuilder {
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn timeout(mut self, seconds: u64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn include_history(mut self, include: bool) -> Self {
        self.include_history = Some(include);
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = Some(capacity);
        self
    }

    pub fn build(self) -> Result<ExchangeConfig> {
        let base_url = self
            .base_url
            .ok_or_else(|| Error::config("base_url is required"))?;

        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(Error::config(format!(
                "base_url must start with http:// or https://, got '{}'",
                base_url
            )));
        }

        let timeout = self.timeout.unwrap_or(120);
        if timeout == 0 {
            return Err(Error::config("timeout must be greater than zero"));
        }

        let event_capacity = self.event_capacity.unwrap_or(128);
        if event_capacity == 0 {
            return Err(Error::config("event_capacity must be greater than zero"));
        }

        Ok(ExchangeConfig {
            base_url,
            endpoint: self.endpoint.unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            timeout,
            auth_token: self.auth_token,
            system_prompt: self.system_prompt.filter(|p| !p.trim().is_empty()),
            include_history: self.include_history.unwrap_or(true),
            retry: self.retry,
            event_capacity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_builder_defaults() {
        let config = ExchangeConfig::builder()
            .base_url("http://localhost:5001/api")
            .build()
            .unwrap();

        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.timeout, 120);
        assert!(config.include_history);
        assert!(config.retry.is_none());
        assert_eq!(config.event_capacity, 128);
    }

    #[test]
    fn test_builder_requires_base_url() {
        let err = ExchangeConfig::builder().build().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_builder_rejects_bad_scheme_and_zero_timeout() {
        assert!(ExchangeConfig::builder().base_url("localhost:5001").build().is_err());
        assert!(
            ExchangeConfig::builder()
                .base_url("http://localhost")
                .timeout(0)
                .build()
                .is_err()
        );
    }

    #[test]
    fn test_endpoint_url_joins_slashes() {
        let config = ExchangeConfig::builder()
            .base_url("http://localhost:5001/api/")
            .endpoint("/chat/message")
            .build()
            .unwrap();
        assert_eq!(config.endpoint_url(), "http://localhost:5001/api/chat/message");
    }

    #[test]
    fn test_debug_masks_token() {
        let config = ExchangeConfig::builder()
            .base_url("http://localhost")
            .auth_token("secret-token")
            .build()
            .unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("secret-token"));
        assert!(debug.contains("***"));
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            (BASE_URL_ENV, "https://tutor.example.com/api"),
            (AUTH_TOKEN_ENV, "abc"),
        ]
        .into_iter()
        .collect();

        let config =
            ExchangeConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(config.base_url, "https://tutor.example.com/api");
        assert_eq!(config.auth_token.as_deref(), Some("abc"));
    }

    #[test]
    fn test_from_lookup_missing_base_url() {
        let err = ExchangeConfig::from_lookup(|_| None).unwrap_err();
        assert!(err.to_string().contains(BASE_URL_ENV));
    }
}
