//! Terminal-state messages to the user who sent the document
//!
//! Texts are fixed per outcome and never carry internal error details.

use std::sync::Arc;

use super::retry::RetryPolicy;
use crate::error::{Error, Result};
use crate::providers::ChatPlatform;
use crate::types::{EventId, NotificationMessage, Recipient, TaskStage, TerminalStatus};

/// User-facing failure categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The attachment is not an image we can decode
    UnreadableImage,
    /// The attachment could not be fetched from the chat platform
    DownloadFailed,
    /// Extraction found nothing usable
    NoData,
    /// The page is not one of the accepted forms
    UnrecognizedDocument,
    /// Attempt or age budget ran out
    RetriesExhausted,
    Internal,
}

impl FailureReason {
    /// Pick the category for a permanent error raised at `stage`
    pub fn classify(error: &Error, stage: TaskStage) -> Self {
        match (error, stage) {
            (Error::ImageDecode(_), _) => FailureReason::UnreadableImage,
            (Error::UnrecognizedDocument(_), _) => FailureReason::UnrecognizedDocument,
            (Error::ResourceExhaustion(_), _) => FailureReason::RetriesExhausted,
            (_, TaskStage::Downloading) => FailureReason::DownloadFailed,
            (Error::PermanentValidation(_), TaskStage::Extracting) => FailureReason::NoData,
            _ => FailureReason::Internal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::UnreadableImage => "unreadable_image",
            FailureReason::DownloadFailed => "download_failed",
            FailureReason::NoData => "no_data",
            FailureReason::UnrecognizedDocument => "unrecognized_document",
            FailureReason::RetriesExhausted => "retries_exhausted",
            FailureReason::Internal => "internal",
        }
    }

    fn user_text(&self) -> &'static str {
        match self {
            FailureReason::UnreadableImage => {
                "The image could not be read. Please send a clear JPEG or PNG photo of the document."
            }
            FailureReason::DownloadFailed => {
                "The attachment could not be downloaded. Please send it again."
            }
            FailureReason::NoData => {
                "No data could be read from the document. Please retake the photo with the whole page in view."
            }
            FailureReason::UnrecognizedDocument => {
                "The photo was not recognized as a supported form. Please photograph the whole form, title included, and send it again."
            }
            FailureReason::RetriesExhausted => {
                "The document could not be processed after several attempts. Please try again later."
            }
            FailureReason::Internal => "An unexpected error occurred while processing the document.",
        }
    }
}

/// Sends the one terminal message of a task
pub struct Notifier {
    chat: Arc<dyn ChatPlatform>,
    retry: RetryPolicy,
}

impl Notifier {
    pub fn new(chat: Arc<dyn ChatPlatform>, retry: RetryPolicy) -> Self {
        Self { chat, retry }
    }

    pub async fn notify_success(
        &self,
        recipient: &Recipient,
        event_id: &EventId,
        title: Option<&str>,
        rows: usize,
        key: &str,
        needs_review: bool,
    ) -> Result<()> {
        let message = NotificationMessage {
            recipient: recipient.clone(),
            status: TerminalStatus::Success,
            text: success_text(event_id, title, rows, key, needs_review),
        };
        self.send(&message).await
    }

    pub async fn notify_failure(&self, recipient: &Recipient, event_id: &EventId, reason: FailureReason) -> Result<()> {
        let message = NotificationMessage {
            recipient: recipient.clone(),
            status: TerminalStatus::Failure,
            text: failure_text(event_id, reason),
        };
        self.send(&message).await
    }

    async fn send(&self, message: &NotificationMessage) -> Result<()> {
        let (result, attempts) = self
            .retry
            .run("send notification", || self.chat.send_message(message))
            .await;
        if let Err(e) = &result {
            tracing::error!(
                recipient = message.recipient.id(),
                status = message.status.as_str(),
                attempts,
                "Notification not delivered: {}",
                e
            );
        }
        result
    }
}

pub fn success_text(event_id: &EventId, title: Option<&str>, rows: usize, key: &str, needs_review: bool) -> String {
    let document = match title {
        Some(title) => format!("Your \"{}\" form", title),
        None => "Your document".to_string(),
    };
    let mut text = format!(
        "{} was converted: {} row{} saved as {} (ref: {}).",
        document,
        rows,
        if rows == 1 { "" } else { "s" },
        key,
        event_id
    );
    if needs_review {
        text.push_str(
            " Some values may be missing or uncertain. Please check the file, or retake the photo if needed.",
        );
    }
    text
}

pub fn failure_text(event_id: &EventId, reason: FailureReason) -> String {
    format!("{} (ref: {})", reason.user_text(), event_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::chat::MockChatPlatform;
    use crate::providers::memory::MemoryChat;
    use std::time::Duration;

    #[test]
    fn test_classification() {
        let e = Error::ImageDecode("bad".into());
        assert_eq!(FailureReason::classify(&e, TaskStage::Preprocessing), FailureReason::UnreadableImage);
        let e = Error::validation("no data");
        assert_eq!(FailureReason::classify(&e, TaskStage::Extracting), FailureReason::NoData);
        assert_eq!(FailureReason::classify(&e, TaskStage::Downloading), FailureReason::DownloadFailed);
        assert_eq!(FailureReason::classify(&e, TaskStage::Emitting), FailureReason::Internal);
    }

    #[test]
    fn test_texts_hide_error_details() {
        let id = EventId::new("evt-1");
        let text = failure_text(&id, FailureReason::classify(&Error::validation("HTTP 403 from processor xyz"), TaskStage::Extracting));
        assert!(!text.contains("403"));
        assert!(text.ends_with("(ref: evt-1)"));

        assert_eq!(
            success_text(&id, None, 1, "evt-1.csv", false),
            "Your document was converted: 1 row saved as evt-1.csv (ref: evt-1)."
        );
        assert!(success_text(&id, None, 3, "evt-1.csv", true).contains("retake"));
        assert!(success_text(&id, Some("現金支払"), 2, "evt-1.csv", false)
            .starts_with("Your \"現金支払\" form was converted: 2 rows"));

        let text = failure_text(
            &id,
            FailureReason::classify(&Error::UnrecognizedDocument("title \"請求書\"".into()), TaskStage::Extracting),
        );
        assert!(text.contains("supported form"));
        assert!(!text.contains("請求書"));
    }

    #[tokio::test]
    async fn test_transient_send_retried() {
        let chat = Arc::new(MemoryChat::new());
        chat.fail_next_sends(1);
        let notifier = Notifier::new(chat.clone(), RetryPolicy::new(2, Duration::from_millis(1)));

        notifier
            .notify_failure(&Recipient::Channel("c-1".into()), &EventId::new("evt-1"), FailureReason::NoData)
            .await
            .unwrap();

        let sent = chat.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].status, TerminalStatus::Failure);
        assert_eq!(sent[0].recipient, Recipient::Channel("c-1".into()));
    }

    #[tokio::test]
    async fn test_permanent_send_error_not_retried() {
        let mut chat = MockChatPlatform::new();
        chat.expect_send_message()
            .times(1)
            .returning(|_| Err(Error::validation("recipient unknown")));
        let notifier = Notifier::new(Arc::new(chat), RetryPolicy::new(3, Duration::from_millis(1)));

        let result = notifier
            .notify_success(&Recipient::User("u-1".into()), &EventId::new("evt-1"), None, 2, "evt-1.csv", false)
            .await;
        assert!(matches!(result, Err(Error::PermanentValidation(_))));
    }
}
