use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use certwatch_mailer::{DeliveryReceipt, DeliveryRequest, MailerError, TemplateMailClient};

/// Hands a rendered template context to the mail delivery system.
///
/// `Ok` means the delivery service acknowledged the message; only then may
/// callers record it as sent.
#[async_trait]
pub trait TemplateDelivery: Send + Sync {
    async fn send(
        &self,
        template: &str,
        to: &str,
        context: Value,
    ) -> Result<DeliveryReceipt, DeliveryError>;
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("recipient address is empty")]
    MissingAddress,
    #[error("mail service error: {0}")]
    Mailer(#[from] MailerError),
}

#[async_trait]
impl TemplateDelivery for TemplateMailClient {
    async fn send(
        &self,
        template: &str,
        to: &str,
        context: Value,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        if to.trim().is_empty() {
            return Err(DeliveryError::MissingAddress);
        }

        let request = DeliveryRequest {
            to: to.to_string(),
            context,
        };
        Ok(self.deliver(template, &request).await?)
    }
}
