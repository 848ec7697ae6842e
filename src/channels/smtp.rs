//! SMTP delivery via lettre.
//!
//! Each unit goes out as multipart/alternative (plain text + HTML). The
//! lettre transport is blocking, so sends run on the blocking pool.

use async_trait::async_trait;
use lettre::message::MultiPart;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use tracing::{info, warn};
use uuid::Uuid;

use crate::channels::DeliveryChannel;
use crate::config::SmtpConfig;
use crate::error::{ConfigError, DeliveryError};
use crate::pipeline::routing::render_html;
use crate::pipeline::types::DeliveryUnit;

pub struct SmtpDelivery {
    transport: SmtpTransport,
    /// Sender address; the destination inbox itself when unset.
    from_address: Option<String>,
    host: String,
}

impl SmtpDelivery {
    pub fn new(config: &SmtpConfig) -> Result<Self, ConfigError> {
        let mut builder = SmtpTransport::relay(&config.host)
            .map_err(|e| ConfigError::InvalidValue {
                key: "SMTP_HOST".into(),
                message: format!("SMTP relay error: {e}"),
            })?
            .port(config.port);

        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.expose_secret().to_string(),
            ));
        }

        Ok(Self {
            transport: builder.build(),
            from_address: config.from_address.clone(),
            host: config.host.clone(),
        })
    }

    fn build_message(&self, unit: &DeliveryUnit, message_id: &str) -> Result<Message, DeliveryError> {
        let permanent = |reason: String| DeliveryError::Permanent {
            destination: unit.destination_address.clone(),
            reason,
        };

        let from = self
            .from_address
            .as_deref()
            .unwrap_or(&unit.destination_address);

        Message::builder()
            .from(from.parse().map_err(|e| permanent(format!("Invalid from address: {e}")))?)
            .to(unit
                .destination_address
                .parse()
                .map_err(|e| permanent(format!("Invalid to address: {e}")))?)
            .subject(unit.formatted_subject.clone())
            .message_id(Some(message_id.to_string()))
            .multipart(MultiPart::alternative_plain_html(
                unit.body.clone(),
                render_html(&unit.body),
            ))
            .map_err(|e| permanent(format!("Message build failed: {e}")))
    }
}

#[async_trait]
impl DeliveryChannel for SmtpDelivery {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn deliver(&self, unit: &DeliveryUnit) -> Result<String, DeliveryError> {
        let message_id = format!("<{}@invoice-router>", Uuid::new_v4());
        let email = self.build_message(unit, &message_id)?;
        let transport = self.transport.clone();
        let destination = unit.destination_address.clone();

        let sent = tokio::task::spawn_blocking(move || transport.send(&email))
            .await
            .map_err(|e| DeliveryError::Transient {
                destination: destination.clone(),
                reason: format!("SMTP send task failed: {e}"),
            })?;

        match sent {
            Ok(_) => {
                info!(
                    destination = %destination,
                    invoice_reference = %unit.invoice_reference,
                    message_id = %message_id,
                    "Unit delivered"
                );
                Ok(message_id)
            }
            Err(e) if e.is_permanent() => {
                warn!(destination = %destination, host = %self.host, error = %e, "SMTP rejected unit");
                Err(DeliveryError::Permanent {
                    destination,
                    reason: format!("SMTP send failed: {e}"),
                })
            }
            Err(e) => {
                warn!(destination = %destination, host = %self.host, error = %e, "SMTP send failed");
                Err(DeliveryError::Transient {
                    destination,
                    reason: format!("SMTP send failed: {e}"),
                })
            }
        }
    }
}
