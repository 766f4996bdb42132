//! Chat platform provider trait

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ImageAsset, NotificationMessage};

/// Operations the relay needs from the chat platform
///
/// Implementations:
/// - `LineWorksClient`: LINE WORKS bot API
/// - `MemoryChat`: in-process fake
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    /// Download the attachment behind a message's file id
    async fn download_attachment(&self, file_id: &str) -> Result<ImageAsset>;

    /// Deliver a text message to a user or channel
    async fn send_message(&self, message: &NotificationMessage) -> Result<()>;
}
