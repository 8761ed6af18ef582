//! Contract between the runner and a dynamic RPC transport

use std::time::Instant;

use async_trait::async_trait;
use tonic::Code;

use crate::error::Result;
use crate::syntax::EndpointDecl;
use crate::value::Fields;

/// Terminal status of one call
#[derive(Debug, Clone, PartialEq)]
pub struct CallStatus {
    pub code: Code,
    pub message: String,
}

impl CallStatus {
    pub fn ok() -> Self {
        Self { code: Code::Ok, message: String::new() }
    }

    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

impl Default for CallStatus {
    fn default() -> Self {
        Self::ok()
    }
}

impl From<tonic::Status> for CallStatus {
    fn from(status: tonic::Status) -> Self {
        Self { code: status.code(), message: status.message().to_string() }
    }
}

/// Everything the transport needs to perform one call
#[derive(Debug)]
pub struct CallRequest<'a> {
    pub endpoint: &'a EndpointDecl,
    pub service: &'a str,
    pub method: &'a str,
    pub headers: &'a [(String, String)],
    pub data: &'a Fields,
    /// Overall run deadline, if any
    pub deadline: Option<Instant>,
}

impl CallRequest<'_> {
    pub fn symbol(&self) -> String {
        format!("{}/{}", self.service, self.method)
    }
}

/// Decoded result of one call
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub status: CallStatus,
    /// Every response message, in arrival order
    pub responses: Vec<Fields>,
    pub response_headers: Vec<(String, String)>,
    pub trailers: Vec<(String, String)>,
    pub requests_sent: u64,
}

impl CallOutcome {
    pub fn responses_received(&self) -> u64 {
        self.responses.len() as u64
    }

    /// Response stored on the invoke: the first message, or an empty mapping
    pub fn primary_response(&self) -> Fields {
        self.responses.first().cloned().unwrap_or_default()
    }
}

/// Running totals across all calls of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvokeStats {
    pub requests_sent: u64,
    pub responses_received: u64,
}

impl InvokeStats {
    pub fn record(&mut self, outcome: &CallOutcome) {
        self.requests_sent += outcome.requests_sent;
        self.responses_received += outcome.responses_received();
    }
}

/// Performs calls without compiled stubs, resolving schemas at run time
///
/// Non-OK RPC statuses are returned inside [`CallOutcome`]; `Err` is reserved
/// for dial, schema, marshalling, and other operational failures.
#[async_trait]
pub trait Invoker: Send {
    async fn invoke(&mut self, request: CallRequest<'_>) -> Result<CallOutcome>;

    fn stats(&self) -> InvokeStats;
}
