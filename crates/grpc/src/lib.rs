//! trpc gRPC transport
//!
//! Calls methods on live servers without generated stubs. Schemas come from
//! server reflection, protoset files, or proto sources compiled with `protoc`;
//! requests and responses travel as [`prost_reflect::DynamicMessage`].

pub mod codec;
pub mod connection;
pub mod convert;
pub mod invoker;
pub mod reflection;
pub mod source;

pub use connection::{DialSettings, TlsSettings, DEFAULT_CONNECT_TIMEOUT};
pub use invoker::{GrpcInvoker, InvokerSettings};
pub use source::{CompositeSource, DescriptorSource, FileSource};
