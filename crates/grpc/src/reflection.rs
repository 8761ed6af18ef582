//! Server reflection client
//!
//! Message types for `grpc.reflection.v1alpha` (wire-identical to
//! `grpc.reflection.v1`) and a [`DescriptorSource`] that fetches file
//! descriptors from a live server.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream;
use prost::Message;
use prost_reflect::{DescriptorPool, ExtensionDescriptor, FileDescriptor};
use prost_types::FileDescriptorProto;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;
use tonic::{Code, Request, Status};
use tracing::debug;

use trpc_common::{Error, Result};

use crate::connection::apply_headers;
use crate::source::{file_containing, DescriptorSource};

#[derive(Clone, PartialEq, Message)]
pub struct ServerReflectionRequest {
    #[prost(string, tag = "1")]
    pub host: String,
    #[prost(oneof = "server_reflection_request::MessageRequest", tags = "3, 4, 5, 6, 7")]
    pub message_request: Option<server_reflection_request::MessageRequest>,
}

pub mod server_reflection_request {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum MessageRequest {
        #[prost(string, tag = "3")]
        FileByFilename(String),
        #[prost(string, tag = "4")]
        FileContainingSymbol(String),
        #[prost(message, tag = "5")]
        FileContainingExtension(super::ExtensionRequest),
        #[prost(string, tag = "6")]
        AllExtensionNumbersOfType(String),
        #[prost(string, tag = "7")]
        ListServices(String),
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct ExtensionRequest {
    #[prost(string, tag = "1")]
    pub containing_type: String,
    #[prost(int32, tag = "2")]
    pub extension_number: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct ServerReflectionResponse {
    #[prost(string, tag = "1")]
    pub valid_host: String,
    #[prost(message, optional, tag = "2")]
    pub original_request: Option<ServerReflectionRequest>,
    #[prost(oneof = "server_reflection_response::MessageResponse", tags = "4, 5, 6, 7")]
    pub message_response: Option<server_reflection_response::MessageResponse>,
}

pub mod server_reflection_response {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum MessageResponse {
        #[prost(message, tag = "4")]
        FileDescriptorResponse(super::FileDescriptorResponse),
        #[prost(message, tag = "5")]
        AllExtensionNumbersResponse(super::ExtensionNumberResponse),
        #[prost(message, tag = "6")]
        ListServicesResponse(super::ListServiceResponse),
        #[prost(message, tag = "7")]
        ErrorResponse(super::ErrorResponse),
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct FileDescriptorResponse {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub file_descriptor_proto: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ExtensionNumberResponse {
    #[prost(string, tag = "1")]
    pub base_type_name: String,
    #[prost(int32, repeated, tag = "2")]
    pub extension_number: Vec<i32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ListServiceResponse {
    #[prost(message, repeated, tag = "1")]
    pub service: Vec<ServiceResponse>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ServiceResponse {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct ErrorResponse {
    #[prost(int32, tag = "1")]
    pub error_code: i32,
    #[prost(string, tag = "2")]
    pub error_message: String,
}

use server_reflection_request::MessageRequest;
use server_reflection_response::MessageResponse;

/// Reflection protocol revision spoken to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReflectionVersion {
    V1Alpha,
    V1,
}

impl ReflectionVersion {
    fn service(self) -> &'static str {
        match self {
            ReflectionVersion::V1Alpha => "grpc.reflection.v1alpha.ServerReflection",
            ReflectionVersion::V1 => "grpc.reflection.v1.ServerReflection",
        }
    }
}

/// Descriptor source backed by the server reflection service
pub struct ReflectionSource {
    channel: Channel,
    prefix: String,
    headers: Vec<(String, String)>,
    version: ReflectionVersion,
    pool: DescriptorPool,
}

impl ReflectionSource {
    /// `prefix` is prepended to the reflection method path, e.g. `/api`
    pub fn new(channel: Channel, prefix: &str, headers: Vec<(String, String)>) -> Self {
        Self {
            channel,
            prefix: prefix.trim_end_matches('/').to_string(),
            headers,
            version: ReflectionVersion::V1Alpha,
            pool: DescriptorPool::new(),
        }
    }

    pub fn version(&self) -> ReflectionVersion {
        self.version
    }

    /// One request/response exchange, switching to v1 if v1alpha is unimplemented
    async fn round_trip(&mut self, request: MessageRequest) -> Result<MessageResponse> {
        loop {
            match self.send(request.clone()).await {
                Ok(response) => {
                    return response
                        .message_response
                        .ok_or_else(|| Error::Schema("Empty server reflection response".to_string()));
                }
                Err(status) if status.code() == Code::Unimplemented && self.version == ReflectionVersion::V1Alpha => {
                    debug!("Server does not implement v1alpha reflection, retrying with v1");
                    self.version = ReflectionVersion::V1;
                }
                Err(status) => {
                    return Err(Error::Schema(format!(
                        "Server reflection failed ({:?}): {}",
                        status.code(),
                        status.message()
                    )));
                }
            }
        }
    }

    async fn send(&self, request: MessageRequest) -> std::result::Result<ServerReflectionResponse, Status> {
        let path: PathAndQuery = format!("{}/{}/ServerReflectionInfo", self.prefix, self.version.service())
            .parse()
            .map_err(|e| Status::internal(format!("invalid reflection path: {e}")))?;

        let mut grpc = Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| Status::unavailable(format!("service was not ready: {e}")))?;

        let message = ServerReflectionRequest { host: String::new(), message_request: Some(request) };
        let mut request = Request::new(stream::iter(vec![message]));
        apply_headers(request.metadata_mut(), &self.headers).map_err(Status::invalid_argument)?;

        let codec = ProstCodec::<ServerReflectionRequest, ServerReflectionResponse>::default();
        let mut responses = grpc.streaming(request, path, codec).await?.into_inner();
        responses
            .message()
            .await?
            .ok_or_else(|| Status::internal("reflection stream closed without a response"))
    }

    /// Fetch descriptor protos; `None` when the server reports the lookup as not found
    async fn fetch_files(&mut self, request: MessageRequest) -> Result<Option<Vec<FileDescriptorProto>>> {
        match self.round_trip(request).await? {
            MessageResponse::FileDescriptorResponse(response) => response
                .file_descriptor_proto
                .iter()
                .map(|bytes| {
                    FileDescriptorProto::decode(bytes.as_slice())
                        .map_err(|e| Error::Schema(format!("Invalid file descriptor from reflection: {e}")))
                })
                .collect::<Result<Vec<_>>>()
                .map(Some),
            MessageResponse::ErrorResponse(err) if err.error_code == Code::NotFound as i32 => Ok(None),
            MessageResponse::ErrorResponse(err) => Err(Error::Schema(err.error_message)),
            _ => Err(Error::Schema("Unexpected server reflection response".to_string())),
        }
    }

    /// Add files to the pool together with every dependency they pull in
    async fn add_files(&mut self, files: Vec<FileDescriptorProto>) -> Result<()> {
        let mut pending: HashMap<String, FileDescriptorProto> = HashMap::new();
        let mut missing: Vec<String> = Vec::new();
        for file in files {
            missing.extend(file.dependency.iter().cloned());
            pending.insert(file.name().to_string(), file);
        }

        while let Some(name) = missing.pop() {
            if pending.contains_key(&name) || self.pool.get_file_by_name(&name).is_some() {
                continue;
            }
            debug!("Fetching dependency {} through reflection", name);
            let fetched = self
                .fetch_files(MessageRequest::FileByFilename(name.clone()))
                .await?
                .ok_or_else(|| Error::Schema(format!("File \"{name}\" not found through reflection")))?;
            for file in fetched {
                missing.extend(file.dependency.iter().cloned());
                pending.insert(file.name().to_string(), file);
            }
        }

        pending.retain(|name, _| self.pool.get_file_by_name(name).is_none());
        if pending.is_empty() {
            return Ok(());
        }
        self.pool
            .add_file_descriptor_protos(pending.into_values())
            .map_err(|e| Error::Schema(e.to_string()))
    }
}

#[async_trait]
impl DescriptorSource for ReflectionSource {
    async fn list_services(&mut self) -> Result<Vec<String>> {
        match self.round_trip(MessageRequest::ListServices("*".to_string())).await? {
            MessageResponse::ListServicesResponse(list) => Ok(list.service.into_iter().map(|s| s.name).collect()),
            MessageResponse::ErrorResponse(err) => Err(Error::Schema(err.error_message)),
            _ => Err(Error::Schema("Unexpected server reflection response".to_string())),
        }
    }

    async fn find_symbol(&mut self, symbol: &str) -> Result<Option<FileDescriptor>> {
        if let Some(file) = file_containing(&self.pool, symbol) {
            return Ok(Some(file));
        }
        let Some(files) = self.fetch_files(MessageRequest::FileContainingSymbol(symbol.to_string())).await? else {
            return Ok(None);
        };
        self.add_files(files).await?;
        Ok(file_containing(&self.pool, symbol))
    }

    async fn all_extensions_for_type(&mut self, type_name: &str) -> Result<Vec<ExtensionDescriptor>> {
        let numbers = match self
            .round_trip(MessageRequest::AllExtensionNumbersOfType(type_name.to_string()))
            .await?
        {
            MessageResponse::AllExtensionNumbersResponse(response) => response.extension_number,
            MessageResponse::ErrorResponse(err) if err.error_code == Code::NotFound as i32 => return Ok(Vec::new()),
            MessageResponse::ErrorResponse(err) => return Err(Error::Schema(err.error_message)),
            _ => return Err(Error::Schema("Unexpected server reflection response".to_string())),
        };

        for number in &numbers {
            let known = self
                .pool
                .get_message_by_name(type_name)
                .is_some_and(|m| m.get_extension(*number as u32).is_some());
            if known {
                continue;
            }
            let request = MessageRequest::FileContainingExtension(ExtensionRequest {
                containing_type: type_name.to_string(),
                extension_number: *number,
            });
            if let Some(files) = self.fetch_files(request).await? {
                self.add_files(files).await?;
            }
        }

        Ok(self
            .pool
            .get_message_by_name(type_name)
            .map(|message| {
                message
                    .extensions()
                    .filter(|ext| numbers.contains(&(ext.number() as i32)))
                    .collect()
            })
            .unwrap_or_default())
    }
}
