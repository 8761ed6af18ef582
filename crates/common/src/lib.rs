//! trpc Common Library
//!
//! The execution and evaluation engine of the trpc test runner: the
//! specification front end, the value model and reference resolver, the
//! invoke registry, expectation checks, and the orchestrator. Transport
//! implementations plug in through the [`Invoker`] trait.

pub mod error;
pub mod expect;
pub mod invoker;
pub mod registry;
pub mod report;
pub mod runner;
pub mod syntax;
pub mod value;

// Re-export commonly used types
pub use error::{Error, Result};
pub use expect::{Expectation, Severity};
pub use invoker::{CallOutcome, CallRequest, CallStatus, InvokeStats, Invoker};
pub use registry::{Invoke, InvokeRegistry};
pub use report::{Diagnostic, RunObserver, RunOutcome, RunReport, SilentObserver, SourceExcerpt};
pub use runner::{SchemaImports, TestPlan};
pub use value::{Fields, Value};

/// trpc version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
