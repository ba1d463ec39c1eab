//! HTTP client for the template-mail delivery service.

pub mod client;

pub use client::{DeliveryReceipt, DeliveryRequest, MailerError, TemplateMailClient};
