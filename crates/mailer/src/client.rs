use hmac::{Hmac, Mac};
use reqwest::{header, Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use url::Url;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the body signature, formatted as `sha256=<hex>`.
pub const SIGNATURE_HEADER: &str = "X-Signature";

/// Client for the template-mail delivery service.
///
/// Every delivery is a `POST {base}/templates/{template}/deliveries` with a
/// JSON body, a bearer API key and an HMAC-SHA256 signature of the body.
#[derive(Clone)]
pub struct TemplateMailClient {
    http: Client,
    base_url: Url,
    api_key: String,
    signing_secret: Vec<u8>,
}

impl TemplateMailClient {
    /// Creates a new client. A trailing slash is added to `base_url` when
    /// missing so template paths resolve below it.
    pub fn new(
        base_url: Url,
        api_key: impl Into<String>,
        signing_secret: Vec<u8>,
        http: Client,
    ) -> Self {
        let mut base_url = base_url;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Self {
            http,
            base_url,
            api_key: api_key.into(),
            signing_secret,
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Delivers one templated message and returns the service acknowledgement.
    pub async fn deliver(
        &self,
        template: &str,
        request: &DeliveryRequest,
    ) -> Result<DeliveryReceipt, MailerError> {
        if template.is_empty() || template.contains('/') {
            return Err(MailerError::InvalidTemplate(template.to_string()));
        }

        let url = self
            .base_url
            .join(&format!("templates/{template}/deliveries"))?;
        let body = serde_json::to_vec(request)?;
        let signature = self.sign(&body)?;

        let response = self
            .http
            .post(url)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.api_key))
            .header(header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, format!("sha256={signature}"))
            .body(body)
            .send()
            .await?;

        parse_json::<DeliveryReceipt>(response).await
    }

    fn sign(&self, body: &[u8]) -> Result<String, MailerError> {
        let mut mac = HmacSha256::new_from_slice(&self.signing_secret)
            .map_err(|_| MailerError::SigningKey)?;
        mac.update(body);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

/// Body sent to the delivery service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryRequest {
    /// Recipient address.
    pub to: String,
    /// Template variables.
    pub context: Value,
}

/// Acknowledgement returned for an accepted delivery.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeliveryReceipt {
    pub delivery_id: String,
}

/// Errors produced by the mail client.
#[derive(Debug, Error)]
pub enum MailerError {
    #[error("invalid template name: {0:?}")]
    InvalidTemplate(String),
    #[error("signing secret rejected")]
    SigningKey,
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

async fn parse_json<T>(response: Response) -> Result<T, MailerError>
where
    T: for<'de> Deserialize<'de>,
{
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(MailerError::Status { status, body });
    }

    Ok(response.json().await?)
}
