pub mod whatsapp;

pub use whatsapp::{format_order_confirmation, MessageTemplate, NotifyError, WhatsAppClient};
