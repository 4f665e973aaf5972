//! User-facing dialogs. The pipeline occasionally has to ask the user a
//! question (an optional halt, an SD card failure); it does so through
//! this interface so the core never depends on a UI toolkit.

use async_trait::async_trait;

/// Dialog surface injected into the controller.
#[async_trait]
pub trait UserPrompt: Send + Sync {
    /// Show an informational message.
    async fn info(&self, title: &str, message: &str);

    /// Ask a yes/no question; `true` means yes.
    async fn confirm(&self, message: &str) -> bool;
}

/// Headless prompt for servers and tests: informational dialogs go to the
/// log, confirmations decline.
pub struct HeadlessPrompt;

#[async_trait]
impl UserPrompt for HeadlessPrompt {
    async fn info(&self, title: &str, message: &str) {
        tracing::info!(title = title, message = message, "dialog");
    }

    async fn confirm(&self, message: &str) -> bool {
        tracing::warn!(message = message, "confirmation requested with no UI attached, declining");
        false
    }
}
