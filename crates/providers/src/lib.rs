//! Completion providers used by the prompt enhancement middleware.

pub mod openai_compat;
pub mod traits;
pub(crate) mod util;

// Re-exports for convenience.
pub use openai_compat::OpenAiCompatProvider;
pub use traits::{CompletionProvider, CompletionRequest, CompletionResponse};
pub use util::api_key_from_env;
