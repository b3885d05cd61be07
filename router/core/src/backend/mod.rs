//! Backend Collaborators
//!
//! Traits the router core consumes, plus the adapters shipped with it.
//!
//! # Available Adapters
//!
//! - **Ollama**: local LLM server (invoker, catalog and lifecycle)
//! - **StaticCatalog**: descriptors from configuration
//! - **InMemoryStore / FileStore**: Cold-tier backing stores

mod catalog;
mod ollama;
mod store;
mod traits;

pub use catalog::StaticCatalog;
pub use ollama::OllamaInvoker;
pub use store::{FileStore, InMemoryStore};
pub use traits::{
    AttemptFailure, BackendError, BackendInvoker, BackendResponse, ModelCatalog, ModelLifecycle,
    PersistentStore, StoreError, StreamingToken,
};
