//! Boundary to the hosted payment processor.
//!
//! The order engine only ever talks to [`PaymentGateway`]; the concrete
//! processor lives behind it (see [`stripe::StripeGateway`]).

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppResult;

pub mod stripe;

pub use stripe::StripeGateway;

/// Metadata marker attached to every intent created for an order.
pub const INTEGRATION_CHECK: (&str, &str) = ("integration_check", "accept_a_payment");

/// Handle returned when an intent is created. The client secret is handed to
/// the buyer's client, the id is kept on the order for verification.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntentStatus {
    pub id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub receipt_email: Option<String>,
}

impl PaymentIntentStatus {
    pub fn is_succeeded(&self) -> bool {
        self.status == "succeeded"
    }

    /// The processor gave up on this intent; it can never succeed.
    pub fn is_rejected(&self) -> bool {
        self.status == "canceled"
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_payment_intent(
        &self,
        amount_minor: i64,
        currency: &str,
        metadata: &BTreeMap<String, String>,
    ) -> AppResult<PaymentIntent>;

    async fn retrieve_payment_intent(&self, id: &str) -> AppResult<PaymentIntentStatus>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(s: &str) -> PaymentIntentStatus {
        PaymentIntentStatus {
            id: "pi_1".into(),
            status: s.into(),
            created_at: Utc::now(),
            receipt_email: None,
        }
    }

    #[test]
    fn only_succeeded_counts_as_paid() {
        assert!(status("succeeded").is_succeeded());
        assert!(!status("processing").is_succeeded());
        assert!(!status("requires_payment_method").is_rejected());
        assert!(status("canceled").is_rejected());
    }
}
