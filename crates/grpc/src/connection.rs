//! Channel dialing and request metadata

use std::path::PathBuf;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue, BinaryMetadataKey, BinaryMetadataValue, MetadataMap};
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity, Uri};
use tracing::debug;

use trpc_common::syntax::EndpointDecl;
use trpc_common::{Error, Result};

/// Default time allowed to establish a connection
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client TLS material
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TlsSettings {
    pub ca_cert: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    /// Name verified against the server certificate
    pub server_name: Option<String>,
    /// `:authority` sent on every call
    pub authority: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DialSettings {
    pub connect_timeout: Duration,
    pub keepalive: Option<Duration>,
    pub user_agent: Option<String>,
    pub tls: TlsSettings,
}

impl Default for DialSettings {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            keepalive: None,
            user_agent: None,
            tls: TlsSettings::default(),
        }
    }
}

/// Open a channel to an endpoint, bounded by the connect timeout
pub async fn dial(endpoint: &EndpointDecl, settings: &DialSettings) -> Result<Channel> {
    let target = endpoint.target();
    let scheme = if endpoint.tls { "https" } else { "http" };
    let dial_error = |reason: String| Error::Dial { target: target.clone(), reason };

    let mut builder = Endpoint::from_shared(format!("{scheme}://{target}"))
        .map_err(|e| dial_error(e.to_string()))?
        .connect_timeout(settings.connect_timeout);
    if let Some(user_agent) = &settings.user_agent {
        builder = builder.user_agent(user_agent.clone()).map_err(|e| dial_error(e.to_string()))?;
    }
    if let Some(interval) = settings.keepalive {
        builder = builder.http2_keep_alive_interval(interval).keep_alive_while_idle(true);
    }
    if endpoint.tls {
        builder = builder
            .tls_config(tls_config(endpoint, &settings.tls)?)
            .map_err(|e| dial_error(e.to_string()))?;
    }
    if let Some(authority) = &settings.tls.authority {
        let origin: Uri = format!("{scheme}://{authority}")
            .parse()
            .map_err(|e| Error::InvalidConfig(format!("invalid authority {authority}: {e}")))?;
        builder = builder.origin(origin);
    }

    debug!("Dialing {} (tls: {}, timeout: {:?})", target, endpoint.tls, settings.connect_timeout);
    match tokio::time::timeout(settings.connect_timeout, builder.connect()).await {
        Ok(Ok(channel)) => Ok(channel),
        Ok(Err(e)) => Err(dial_error(transport_reason(&e))),
        Err(_) => Err(dial_error("context deadline exceeded".to_string())),
    }
}

fn tls_config(endpoint: &EndpointDecl, tls: &TlsSettings) -> Result<ClientTlsConfig> {
    let mut config = ClientTlsConfig::new();
    if let Some(ca_cert) = &tls.ca_cert {
        config = config.ca_certificate(Certificate::from_pem(std::fs::read(ca_cert)?));
    }
    if let (Some(cert), Some(key)) = (&tls.cert, &tls.key) {
        config = config.identity(Identity::from_pem(std::fs::read(cert)?, std::fs::read(key)?));
    }
    let domain = tls
        .server_name
        .as_ref()
        .or(tls.authority.as_ref())
        .cloned()
        .unwrap_or_else(|| endpoint.host.clone());
    Ok(config.domain_name(domain))
}

/// Full error chain of a transport error, which tonic reports in layers
fn transport_reason(err: &tonic::transport::Error) -> String {
    let mut reason = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        reason.push_str(": ");
        reason.push_str(&cause.to_string());
        source = cause.source();
    }
    reason
}

/// Add `key: value` pairs to request metadata; `-bin` keys carry base64 values
pub fn apply_headers<'a, I>(metadata: &mut MetadataMap, headers: I) -> std::result::Result<(), String>
where
    I: IntoIterator<Item = &'a (String, String)>,
{
    for (key, value) in headers {
        let key = key.to_ascii_lowercase();
        if key.ends_with("-bin") {
            let key = BinaryMetadataKey::from_bytes(key.as_bytes())
                .map_err(|e| format!("invalid header name {key}: {e}"))?;
            let bytes = STANDARD
                .decode(value)
                .map_err(|e| format!("invalid base64 value for header {}: {e}", key.as_str()))?;
            metadata.append_bin(key, BinaryMetadataValue::from_bytes(&bytes));
        } else {
            let key = AsciiMetadataKey::from_bytes(key.as_bytes())
                .map_err(|e| format!("invalid header name {key}: {e}"))?;
            let value: AsciiMetadataValue = value
                .parse()
                .map_err(|e| format!("invalid value for header {}: {e}", key.as_str()))?;
            metadata.append(key, value);
        }
    }
    Ok(())
}

/// Metadata as plain text pairs, in wire order
pub fn metadata_pairs(metadata: &MetadataMap) -> Vec<(String, String)> {
    metadata
        .clone()
        .into_headers()
        .iter()
        .map(|(key, value)| (key.to_string(), String::from_utf8_lossy(value.as_bytes()).into_owned()))
        .collect()
}

/// `{prefix}/{service}/{method}`
pub fn call_path(prefix: Option<&str>, service: &str, method: &str) -> Result<PathAndQuery> {
    let prefix = prefix.unwrap_or("").trim_end_matches('/');
    format!("{prefix}/{service}/{method}")
        .parse()
        .map_err(|e| Error::Schema(format!("Invalid method path for {service}/{method}: {e}")))
}
