//! Dynamic gRPC invoker: schema lookup, marshalling, and the call itself

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use prost_reflect::{DynamicMessage, FileDescriptor, MethodDescriptor};
use tonic::client::Grpc;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;
use tonic::{Code, Request, Status};
use tracing::{debug, warn};

use trpc_common::syntax::EndpointDecl;
use trpc_common::{CallOutcome, CallRequest, CallStatus, Error, InvokeStats, Invoker, Result, SchemaImports};

use crate::codec::DynamicCodec;
use crate::connection::{apply_headers, call_path, dial, metadata_pairs, DialSettings};
use crate::convert;
use crate::reflection::ReflectionSource;
use crate::source::{CompositeSource, DescriptorSource, FileSource};

/// Everything that shapes calls beyond the specification itself
#[derive(Debug, Clone, Default)]
pub struct InvokerSettings {
    pub dial: DialSettings,
    /// Limit for encoded and decoded messages, tonic's default when unset
    pub max_message_size: Option<usize>,
    pub allow_unknown_fields: bool,
    /// Sent on every call, including reflection
    pub headers: Vec<(String, String)>,
    /// Sent on reflection calls only
    pub reflect_headers: Vec<(String, String)>,
    /// `Some(true)` queries reflection even when schema files are imported
    pub reflection: Option<bool>,
}

/// Open channel plus the schema source bound to it
struct Connection {
    endpoint: EndpointDecl,
    channel: Channel,
    source: Box<dyn DescriptorSource>,
    /// Reflection is part of `source` and its pool grows on demand
    reflective: bool,
    methods: HashMap<String, MethodDescriptor>,
}

impl Connection {
    async fn method(&mut self, service: &str, method: &str) -> Result<MethodDescriptor> {
        let key = format!("{service}/{method}");
        if let Some(found) = self.methods.get(&key) {
            return Ok(found.clone());
        }

        let Some(file) = self.source.find_symbol(service).await? else {
            let services = self.source.list_services().await.unwrap_or_default();
            return Err(Error::Schema(format!(
                "Service \"{service}\" not found, available services:\n{}",
                services.join("\n")
            )));
        };
        let mut found = find_method(&file, service, method)?;

        // pulls extension files of the payload types into the reflection pool
        if self.reflective {
            for type_name in [found.input().full_name().to_string(), found.output().full_name().to_string()] {
                match self.source.all_extensions_for_type(&type_name).await {
                    Ok(extensions) => debug!("{} has {} known extension(s)", type_name, extensions.len()),
                    Err(e) => debug!("Could not list extensions of {}: {}", type_name, e),
                }
            }
            if let Some(file) = self.source.find_symbol(service).await? {
                found = find_method(&file, service, method)?;
            }
        }

        debug!(
            "Resolved {} (client streaming: {}, server streaming: {})",
            found.full_name(),
            found.is_client_streaming(),
            found.is_server_streaming()
        );
        self.methods.insert(key, found.clone());
        Ok(found)
    }
}

fn find_method(file: &FileDescriptor, service: &str, method: &str) -> Result<MethodDescriptor> {
    let descriptor = file
        .parent_pool()
        .get_service_by_name(service)
        .ok_or_else(|| Error::Schema(format!("Symbol \"{service}\" is not a service")))?;
    let found = descriptor.methods().find(|m| m.name() == method);
    found.ok_or_else(|| Error::Schema(format!("Service \"{service}\" does not include a method named \"{method}\"")))
}

/// [`Invoker`] over tonic channels, one cached per endpoint
pub struct GrpcInvoker {
    settings: InvokerSettings,
    files: Option<FileSource>,
    connections: HashMap<String, Connection>,
    stats: InvokeStats,
}

impl GrpcInvoker {
    pub fn new(settings: InvokerSettings, files: Option<FileSource>) -> Self {
        Self { settings, files, connections: HashMap::new(), stats: InvokeStats::default() }
    }

    /// Invoker for a specification, loading the schema files it imports
    pub fn for_imports(settings: InvokerSettings, imports: &SchemaImports) -> Result<Self> {
        let files = if imports.is_empty() { None } else { Some(FileSource::load(imports)?) };
        Ok(Self::new(settings, files))
    }

    /// Drop every open channel
    pub fn close(&mut self) {
        for (name, _) in self.connections.drain() {
            debug!("Closing connection to endpoint {}", name);
        }
    }

    /// Schema source for an endpoint and whether reflection takes part in it
    fn source_for(&self, endpoint: &EndpointDecl, channel: &Channel) -> (Box<dyn DescriptorSource>, bool) {
        let reflection = || {
            let prefix = endpoint
                .reflect_path
                .as_deref()
                .or(endpoint.path_prefix.as_deref())
                .unwrap_or("");
            let headers = self
                .settings
                .headers
                .iter()
                .chain(&self.settings.reflect_headers)
                .cloned()
                .collect();
            ReflectionSource::new(channel.clone(), prefix, headers)
        };
        match (&self.files, self.settings.reflection) {
            (None, _) => (Box::new(reflection()), true),
            (Some(files), Some(true)) => (Box::new(CompositeSource::new(reflection(), files.clone())), true),
            (Some(files), _) => (Box::new(files.clone()), false),
        }
    }

    async fn connection(&mut self, endpoint: &EndpointDecl) -> Result<&mut Connection> {
        let stale = self
            .connections
            .get(&endpoint.name)
            .map_or(true, |existing| existing.endpoint != *endpoint);
        if stale {
            let channel = dial(endpoint, &self.settings.dial).await?;
            let (source, reflective) = self.source_for(endpoint, &channel);
            self.connections.insert(
                endpoint.name.clone(),
                Connection { endpoint: endpoint.clone(), channel, source, reflective, methods: HashMap::new() },
            );
        }
        self.connections.get_mut(&endpoint.name).ok_or_else(|| Error::Dial {
            target: endpoint.target(),
            reason: "connection was not established".to_string(),
        })
    }
}

#[async_trait]
impl Invoker for GrpcInvoker {
    async fn invoke(&mut self, request: CallRequest<'_>) -> Result<CallOutcome> {
        let symbol = request.symbol();
        let allow_unknown_fields = self.settings.allow_unknown_fields;
        let max_message_size = self.settings.max_message_size;
        let extra_headers = self.settings.headers.clone();

        let connection = self.connection(request.endpoint).await?;
        let method = connection.method(request.service, request.method).await?;
        let message = convert::to_message(&method.input(), request.data, allow_unknown_fields)?;
        let path = call_path(request.endpoint.path_prefix.as_deref(), request.service, request.method)?;

        let mut call = Request::new(stream::iter(vec![message]));
        apply_headers(call.metadata_mut(), extra_headers.iter().chain(request.headers))
            .map_err(|reason| Error::Transport { symbol: symbol.clone(), reason })?;
        if let Some(deadline) = request.deadline {
            call.set_timeout(deadline.saturating_duration_since(Instant::now()));
        }

        let mut grpc = Grpc::new(connection.channel.clone());
        if let Some(limit) = max_message_size {
            grpc = grpc.max_decoding_message_size(limit).max_encoding_message_size(limit);
        }

        let pending = exchange(grpc, call, path, DynamicCodec::new(method.output()));
        let mut exchange = match request.deadline {
            Some(deadline) => tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), pending)
                .await
                .unwrap_or_else(|_| Exchange::failed(Status::deadline_exceeded("context deadline exceeded"))),
            None => pending.await,
        };

        if closed_without_trailers(&exchange.status) {
            warn!("Server closed {} without sending trailers: {}", symbol, exchange.status.message);
            exchange.status = CallStatus::ok();
        }
        if request.endpoint.ignore_trailers {
            exchange.trailers.clear();
        }

        let outcome = CallOutcome {
            status: exchange.status,
            responses: exchange.messages.iter().map(convert::to_fields).collect(),
            response_headers: exchange.headers,
            trailers: exchange.trailers,
            requests_sent: exchange.requests_sent,
        };
        self.stats.record(&outcome);
        debug!(
            "{} finished with {:?}, {} response(s)",
            symbol,
            outcome.status.code,
            outcome.responses_received()
        );
        Ok(outcome)
    }

    fn stats(&self) -> InvokeStats {
        self.stats
    }
}

/// Raw result of one streaming call
#[derive(Debug, Default)]
struct Exchange {
    status: CallStatus,
    headers: Vec<(String, String)>,
    messages: Vec<DynamicMessage>,
    trailers: Vec<(String, String)>,
    requests_sent: u64,
}

impl Exchange {
    fn failed(status: Status) -> Self {
        Self { trailers: metadata_pairs(status.metadata()), status: status.into(), ..Default::default() }
    }
}

async fn exchange<S>(mut grpc: Grpc<Channel>, request: Request<S>, path: PathAndQuery, codec: DynamicCodec) -> Exchange
where
    S: futures::Stream<Item = DynamicMessage> + Send + 'static,
{
    if let Err(e) = grpc.ready().await {
        return Exchange::failed(Status::unavailable(format!("service was not ready: {e}")));
    }

    let response = match grpc.streaming(request, path, codec).await {
        Ok(response) => response,
        Err(status) => {
            return Exchange { requests_sent: 1, ..Exchange::failed(status) };
        }
    };

    let mut exchange = Exchange {
        headers: metadata_pairs(response.metadata()),
        requests_sent: 1,
        ..Default::default()
    };
    let mut messages = response.into_inner();
    loop {
        match messages.message().await {
            Ok(Some(message)) => exchange.messages.push(message),
            Ok(None) => break,
            Err(status) => {
                exchange.trailers = metadata_pairs(status.metadata());
                exchange.status = status.into();
                return exchange;
            }
        }
    }
    match messages.trailers().await {
        Ok(Some(trailers)) => exchange.trailers = metadata_pairs(&trailers),
        Ok(None) => {}
        Err(status) => exchange.status = status.into(),
    }
    exchange
}

/// Servers that end a call without trailers are conformant for our purposes
fn closed_without_trailers(status: &CallStatus) -> bool {
    if status.code == Code::Ok {
        return false;
    }
    let message = status.message.to_ascii_lowercase();
    ["without sending trailers", "missing trailers", "missing grpc-status"]
        .iter()
        .any(|needle| message.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(Code::Internal, "server closed the stream without sending trailers", true ; "go wording")]
    #[test_case(Code::Unknown, "protocol error: missing grpc-status", true ; "missing status")]
    #[test_case(Code::Internal, "boom", false ; "real failure")]
    #[test_case(Code::Ok, "", false ; "ok")]
    fn test_closed_without_trailers(code: Code, message: &str, expected: bool) {
        assert_eq!(closed_without_trailers(&CallStatus::new(code, message)), expected);
    }

    #[test]
    fn test_failed_exchange_keeps_status() {
        let exchange = Exchange::failed(Status::deadline_exceeded("context deadline exceeded"));
        assert_eq!(exchange.status.code, Code::DeadlineExceeded);
        assert_eq!(exchange.requests_sent, 0);
        assert!(exchange.messages.is_empty());
    }
}
