use std::env;

use fabrq::FabrqError;
use redis::{ConnectionAddr, ConnectionInfo, IntoConnectionInfo, RedisConnectionInfo};
use secrecy::{ExposeSecret, SecretString};

pub const DEFAULT_NAMESPACE: &str = "fabrq";

/// How to reach the Redis server.
///
/// Either a single `url` or the individual `host`, `port`, `password` and `db`. When `url` is
/// set the individual parameters are ignored.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub password: Option<SecretString>,
    pub db: i64,
    /// Prefix of every key written by the store.
    pub namespace: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_owned(),
            port: 6379,
            password: None,
            db: 0,
            namespace: DEFAULT_NAMESPACE.to_owned(),
        }
    }
}

fn configuration_error(message: impl Into<String>) -> FabrqError {
    FabrqError::Configuration(message.into())
}

impl StoreConfig {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    pub fn with_password(self, password: impl Into<String>) -> Self {
        Self {
            password: Some(SecretString::from(password.into())),
            ..self
        }
    }

    pub fn with_db(self, db: i64) -> Self {
        Self { db, ..self }
    }

    pub fn with_namespace(self, namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..self
        }
    }

    /// Read `REDIS_URL`, or `REDIS_HOST`, `REDIS_PORT`, `REDIS_PASSWORD` and `REDIS_DB`.
    ///
    /// Unset variables keep their defaults; malformed ones are an error.
    pub fn from_env() -> Result<Self, FabrqError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, FabrqError> {
        let mut config = Self::default();

        if let Some(url) = lookup("REDIS_URL") {
            config.url = Some(url);
        }
        if let Some(host) = lookup("REDIS_HOST") {
            config.host = host;
        }
        if let Some(port) = lookup("REDIS_PORT") {
            config.port = port
                .parse()
                .map_err(|_| configuration_error(format!("REDIS_PORT is not a port: {port}")))?;
        }
        if let Some(password) = lookup("REDIS_PASSWORD").filter(|password| !password.is_empty()) {
            config.password = Some(SecretString::from(password));
        }
        if let Some(db) = lookup("REDIS_DB") {
            config.db = db
                .parse()
                .map_err(|_| configuration_error(format!("REDIS_DB is not a number: {db}")))?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), FabrqError> {
        if self.namespace.trim().is_empty() {
            return Err(configuration_error("the key namespace must not be empty"));
        }
        if self.url.is_some() {
            return self.connection_info().map(|_| ());
        }
        if self.host.trim().is_empty() {
            return Err(configuration_error("a redis host is required"));
        }
        if self.port == 0 {
            return Err(configuration_error("a redis port is required"));
        }
        if self.db < 0 {
            return Err(configuration_error(format!(
                "the redis db index must not be negative: {}",
                self.db
            )));
        }
        Ok(())
    }

    pub fn connection_info(&self) -> Result<ConnectionInfo, FabrqError> {
        if let Some(url) = &self.url {
            return url
                .as_str()
                .into_connection_info()
                .map_err(|error| configuration_error(format!("invalid redis url: {error}")));
        }
        Ok(ConnectionInfo {
            addr: ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: RedisConnectionInfo {
                db: self.db,
                password: self
                    .password
                    .as_ref()
                    .map(|password| password.expose_secret().to_owned()),
                ..Default::default()
            },
        })
    }
}
