use std::fmt::Write as _;

use menu_core::Order;
use reqwest::{Client, Response, StatusCode};
use thiserror::Error;
use url::Url;

/// Client for the Twilio Messages API, sending over the WhatsApp channel.
#[derive(Clone)]
pub struct WhatsAppClient {
    http: Client,
    base_url: Url,
    account_sid: String,
    auth_token: String,
    from_phone: String,
}

impl WhatsAppClient {
    /// Creates a new client. `base_url` is the API root including the
    /// version segment, e.g. `https://api.twilio.com/2010-04-01/`.
    pub fn new(
        account_sid: impl Into<String>,
        auth_token: impl Into<String>,
        from_phone: impl Into<String>,
        base_url: Url,
        http: Client,
    ) -> Self {
        Self {
            http,
            base_url,
            account_sid: account_sid.into(),
            auth_token: auth_token.into(),
            from_phone: from_phone.into(),
        }
    }

    /// Sender number shown to customers.
    pub fn from_phone(&self) -> &str {
        &self.from_phone
    }

    /// Posts a single message to `to`.
    pub async fn send(&self, to: &str, body: &str) -> Result<(), NotifyError> {
        let to = to.trim();
        if to.is_empty() {
            return Err(NotifyError::MissingRecipient);
        }

        let url = self
            .base_url
            .join(&format!("Accounts/{}/Messages.json", self.account_sid))?;

        let to = format!("whatsapp:{to}");
        let from = format!("whatsapp:{}", self.from_phone);
        let response = self
            .http
            .post(url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[("To", to.as_str()), ("From", from.as_str()), ("Body", body)])
            .send()
            .await?;

        ensure_success(response).await
    }
}

/// Static values rendered into every confirmation message.
#[derive(Debug, Clone)]
pub struct MessageTemplate {
    pub restaurant_name: String,
    pub menu_link: String,
}

/// Renders the order receipt sent to the customer.
pub fn format_order_confirmation(order: &Order, template: &MessageTemplate, from_phone: &str) -> String {
    let mut items = String::new();
    for line in &order.items {
        let _ = match line.line_total() {
            Some(amount) => writeln!(items, "{} - {}x - ${:.2}", line.name, line.quantity, amount),
            None => writeln!(items, "{} - {}x", line.name, line.quantity),
        };
    }

    format!(
        "*Name:* {name}\n\
         *Email:* {email}\n\
         --------------------------------\n\
         *Order ID:* {id}\n\n\
         *Items Ordered:*\n{items}\n\
         *Total:* ${total:.2}\n\
         *Payment Status:* {payment}\n\n\
         *Restaurant:* {restaurant}\n\
         *WhatsApp:* {from_phone}\n\n\
         🔗 *Go to Menu:* {link}",
        name = order.user_details.name,
        email = order.user_details.email,
        id = order.id,
        total = order.total,
        payment = order.payment_status.as_str().to_uppercase(),
        restaurant = template.restaurant_name,
        link = template.menu_link,
    )
}

/// Errors produced by the WhatsApp client.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("order has no customer phone number")]
    MissingRecipient,
}

async fn ensure_success(response: Response) -> Result<(), NotifyError> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(NotifyError::Status { status, body });
    }
    Ok(())
}
