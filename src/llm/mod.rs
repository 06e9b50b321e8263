//! The chat client contract.
//!
//! Provider adapters (OpenAI-style, Anthropic-style, local servers) live
//! outside this crate; the engine only depends on this trait. Implementations
//! may buffer or stream internally; the engine treats a call as
//! synchronous-blocking and does not cancel it.

use std::sync::Arc;

use async_trait::async_trait;

use crate::chat::{ChatOptions, Message, Usage};

/// A polymorphic chat client.
///
/// Stateless from the engine's perspective: the full message list is passed
/// on every call. `usage` may be `None`; callers must tolerate that.
#[async_trait]
pub trait Client: Send + Sync {
    async fn chat(
        &self,
        messages: Vec<Message>,
        options: Option<&ChatOptions>,
    ) -> Result<(Message, Option<Usage>), anyhow::Error>;
}

/// Shared handle to a client, as stored in flows, steps and the registry.
pub type ClientRef = Arc<dyn Client>;
