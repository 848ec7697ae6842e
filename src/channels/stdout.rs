//! Stdout delivery for local runs without an SMTP relay.

use async_trait::async_trait;
use uuid::Uuid;

use crate::channels::DeliveryChannel;
use crate::error::DeliveryError;
use crate::pipeline::types::DeliveryUnit;

/// Prints each unit instead of sending it.
pub struct StdoutDelivery;

impl StdoutDelivery {
    pub fn new() -> Self {
        Self
    }
}

impl Default for StdoutDelivery {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeliveryChannel for StdoutDelivery {
    fn name(&self) -> &str {
        "stdout"
    }

    async fn deliver(&self, unit: &DeliveryUnit) -> Result<String, DeliveryError> {
        println!(
            "\nTo: {}\nSubject: {}\n\n{}\n",
            unit.destination_address, unit.formatted_subject, unit.body
        );
        Ok(format!("stdout-{}", Uuid::new_v4()))
    }
}
