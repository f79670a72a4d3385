use std::sync::Arc;

use menu_core::Order;
use menu_notify::{format_order_confirmation, MessageTemplate, NotifyError, WhatsAppClient};
use menu_util::NotifyConfig;
use metrics::counter;
use reqwest::Client;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use url::Url;

/// Delivers order confirmations outside the order's transaction.
#[derive(Clone)]
pub struct NotificationDispatcher {
    client: Option<Arc<WhatsAppClient>>,
    template: Arc<MessageTemplate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Skipped,
}

impl NotificationDispatcher {
    /// Builds the dispatcher. Without credentials every dispatch is a no-op.
    pub fn from_config(
        config: &NotifyConfig,
        template: MessageTemplate,
    ) -> Result<Self, NotifyError> {
        let Some(credentials) = config.credentials.as_ref() else {
            warn!(
                stage = "notify",
                "twilio credentials not configured; order confirmations will be skipped"
            );
            return Ok(Self::disabled(template));
        };

        let base_url = Url::parse(&config.api_base)?;
        let http = Client::builder().timeout(config.timeout).build()?;
        let client = WhatsAppClient::new(
            credentials.account_sid.clone(),
            credentials.auth_token.clone(),
            credentials.from_phone.clone(),
            base_url,
            http,
        );
        info!(stage = "notify", from = %credentials.from_phone, "whatsapp notifications enabled");

        Ok(Self {
            client: Some(Arc::new(client)),
            template: Arc::new(template),
        })
    }

    pub fn disabled(template: MessageTemplate) -> Self {
        Self {
            client: None,
            template: Arc::new(template),
        }
    }

    #[cfg(test)]
    pub fn with_client(client: WhatsAppClient, template: MessageTemplate) -> Self {
        Self {
            client: Some(Arc::new(client)),
            template: Arc::new(template),
        }
    }

    /// Spawns the confirmation for a committed order and returns immediately.
    /// The outcome is only logged and counted.
    pub fn dispatch(&self, order: Order) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            match dispatcher.send_order_confirmation(&order).await {
                Ok(Delivery::Sent) => {
                    counter!("notifications_total", "result" => "sent").increment(1);
                    info!(stage = "notify", order_id = %order.id, "order confirmation sent");
                }
                Ok(Delivery::Skipped) => {
                    counter!("notifications_total", "result" => "skipped").increment(1);
                }
                Err(err) => {
                    counter!("notifications_total", "result" => "failed").increment(1);
                    warn!(stage = "notify", order_id = %order.id, error = %err, "order confirmation failed");
                }
            }
        })
    }

    pub async fn send_order_confirmation(&self, order: &Order) -> Result<Delivery, NotifyError> {
        let Some(client) = self.client.as_ref() else {
            return Ok(Delivery::Skipped);
        };

        let body = format_order_confirmation(order, &self.template, client.from_phone());
        client.send(&order.user_details.phone, &body).await?;
        Ok(Delivery::Sent)
    }
}
