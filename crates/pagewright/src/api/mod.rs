//! Provider interaction layer: chat and embeddings clients, retry, trace ids.
//!
//! - [`openrouter`]: [`OpenRouterClient`], the default [`ChatModel`](crate::ChatModel).
//! - [`embedding`]: [`Embedder`] trait and an OpenAI-compatible client used
//!   by [`tools::discovery`](crate::tools::discovery).
//! - [`retry`]: transient error detection (429, 5xx, network timeouts) with
//!   configurable exponential backoff and jitter. Never retries 400/401 errors.
//! - [`tracing`]: correlation IDs (`trace_id` / `span_id` / session ids) and
//!   the cumulative [`TokenTally`].

pub mod embedding;
pub mod openrouter;
pub mod retry;
pub mod tracing;

// Re-export commonly used items at the module level.
pub use embedding::{Embedder, OpenAiEmbedder, cosine_similarity};
pub use openrouter::OpenRouterClient;
pub use retry::RetryConfig;
pub use tracing::{TokenTally, generate_session_id, generate_span_id, generate_trace_id};
