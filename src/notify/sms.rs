use async_trait::async_trait;
use tracing::info;

/// Outbound SMS seam. Best effort: a failed send never rolls back the
/// challenge that triggered it.
#[async_trait]
pub trait SmsSender: Send + Sync {
    async fn send(&self, phone: &str, message: &str);
}

/// Default sender: logs the message instead of hitting a gateway. The
/// production gateway client implements the same trait.
pub struct LogSms;

#[async_trait]
impl SmsSender for LogSms {
    async fn send(&self, phone: &str, message: &str) {
        info!(phone, message, "sms (log sender)");
    }
}
