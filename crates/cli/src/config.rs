//! Runner configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use trpc_common::syntax::{EndpointDecl, TestMeta};
use trpc_common::{Error, Result};
use trpc_grpc::{DialSettings, InvokerSettings, TlsSettings, DEFAULT_CONNECT_TIMEOUT};

/// Runner configuration, from a TOML file and command-line overrides
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Seconds allowed to establish each connection
    pub connect_timeout: f64,

    /// Overall deadline in seconds for one specification, 0 for none
    pub max_time: f64,

    /// HTTP/2 keep-alive ping interval in seconds, 0 to disable
    pub keepalive_time: f64,

    /// Message size limit in bytes, 0 for the transport default
    pub max_message_size: i64,

    /// Query server reflection even when schema files are imported
    pub reflection: Option<bool>,

    /// Drop request fields the schema does not know instead of failing
    pub allow_unknown_fields: bool,

    pub user_agent: Option<String>,

    /// `name: value` headers sent on every call
    pub headers: Vec<String>,

    /// `name: value` headers sent on reflection calls only
    pub reflect_headers: Vec<String>,

    /// Exit with `64 + <status code>` on a failed test
    pub status_exit_code: bool,

    pub tls: TlsConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT.as_secs_f64(),
            max_time: 0.0,
            keepalive_time: 0.0,
            max_message_size: 0,
            reflection: None,
            allow_unknown_fields: false,
            user_agent: None,
            headers: Vec::new(),
            reflect_headers: Vec::new(),
            status_exit_code: false,
            tls: TlsConfig::default(),
        }
    }
}

/// Client TLS configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TlsConfig {
    /// CA bundle used to verify servers
    pub ca_cert: Option<PathBuf>,

    /// Client certificate (PEM)
    pub cert: Option<PathBuf>,

    /// Client private key (PEM)
    pub key: Option<PathBuf>,

    /// Server name expected in the certificate
    pub server_name: Option<String>,

    /// `:authority` pseudo-header override
    pub authority: Option<String>,
}

impl RunnerConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Reject settings that cannot work before any network activity
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidConfig(msg));
        for (name, value) in [
            ("connect_timeout", self.connect_timeout),
            ("max_time", self.max_time),
            ("keepalive_time", self.keepalive_time),
        ] {
            if Duration::try_from_secs_f64(value).is_err() {
                return invalid(format!("{name} must be a non-negative number of seconds, got {value}"));
            }
        }
        if self.max_message_size < 0 {
            return invalid("max_message_size must not be negative".to_string());
        }
        match (&self.tls.cert, &self.tls.key) {
            (Some(_), None) => return invalid("the cert option requires the key option".to_string()),
            (None, Some(_)) => return invalid("the key option requires the cert option".to_string()),
            _ => {}
        }
        if let (Some(server_name), Some(authority)) = (&self.tls.server_name, &self.tls.authority) {
            if server_name != authority {
                return invalid(format!(
                    "server_name ({server_name}) and authority ({authority}) are both set to different values"
                ));
            }
        }
        for header in self.headers.iter().chain(&self.reflect_headers) {
            parse_header(header)?;
        }
        Ok(())
    }

    /// Client certificates only make sense on TLS endpoints; a CA bundle is
    /// simply unused on plaintext ones
    pub fn check_endpoint(&self, endpoint: &EndpointDecl) -> Result<()> {
        if !endpoint.tls && self.tls.cert.is_some() {
            return Err(Error::InvalidConfig(format!(
                "endpoint {} is plaintext but a client certificate is configured",
                endpoint.name
            )));
        }
        Ok(())
    }

    /// Overall deadline for a run; the test metadata wins when set
    pub fn max_time_for(&self, meta: &TestMeta) -> f64 {
        if meta.max_time > 0.0 {
            meta.max_time
        } else {
            self.max_time
        }
    }

    /// Transport settings for a run; the test metadata `timeout` wins when set
    pub fn invoker_settings(&self, meta: &TestMeta) -> Result<InvokerSettings> {
        let connect_timeout = if meta.timeout > 0.0 { meta.timeout } else { self.connect_timeout };
        let connect_timeout = Duration::try_from_secs_f64(connect_timeout)
            .ok()
            .filter(|timeout| !timeout.is_zero())
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        let keepalive = Duration::try_from_secs_f64(self.keepalive_time)
            .ok()
            .filter(|interval| !interval.is_zero());

        Ok(InvokerSettings {
            dial: DialSettings {
                connect_timeout,
                keepalive,
                user_agent: self.user_agent.clone(),
                tls: TlsSettings {
                    ca_cert: self.tls.ca_cert.clone(),
                    cert: self.tls.cert.clone(),
                    key: self.tls.key.clone(),
                    server_name: self.tls.server_name.clone(),
                    authority: self.tls.authority.clone(),
                },
            },
            max_message_size: usize::try_from(self.max_message_size).ok().filter(|size| *size > 0),
            allow_unknown_fields: self.allow_unknown_fields,
            headers: self.headers.iter().map(|h| parse_header(h)).collect::<Result<_>>()?,
            reflect_headers: self.reflect_headers.iter().map(|h| parse_header(h)).collect::<Result<_>>()?,
            reflection: self.reflection,
        })
    }
}

/// Split a `name: value` header
pub fn parse_header(header: &str) -> Result<(String, String)> {
    match header.split_once(':') {
        Some((name, value)) if !name.trim().is_empty() => Ok((name.trim().to_string(), value.trim().to_string())),
        _ => Err(Error::InvalidConfig(format!("header \"{header}\" must have the form \"name: value\""))),
    }
}
