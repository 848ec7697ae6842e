//! Outbound delivery of routed units.

pub mod smtp;
pub mod stdout;

use async_trait::async_trait;

use crate::error::DeliveryError;
use crate::pipeline::types::DeliveryUnit;

pub use smtp::SmtpDelivery;
pub use stdout::StdoutDelivery;

/// Sends one delivery unit to its destination inbox.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    fn name(&self) -> &str;

    /// Returns a receipt (e.g. the sent Message-ID) on acceptance.
    async fn deliver(&self, unit: &DeliveryUnit) -> Result<String, DeliveryError>;
}
