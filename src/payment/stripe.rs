use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;

use super::{PaymentGateway, PaymentIntent, PaymentIntentStatus};
use crate::error::{AppError, AppResult};

/// Payment intents over the Stripe REST API.
#[derive(Clone)]
pub struct StripeGateway {
    client: Client,
    api_base: String,
    secret_key: String,
}

#[derive(Debug, Deserialize)]
struct StripeIntent {
    id: String,
    client_secret: Option<String>,
    status: String,
    created: i64,
    receipt_email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    message: Option<String>,
}

impl StripeGateway {
    pub fn new(api_base: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            secret_key: secret_key.into(),
        }
    }

    async fn send(&self, request: RequestBuilder) -> AppResult<StripeIntent> {
        let response = request
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(|e| AppError::Upstream(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<StripeErrorBody>()
                .await
                .ok()
                .and_then(|body| body.error.message)
                .unwrap_or_else(|| status.to_string());
            tracing::warn!(%status, %message, "stripe request rejected");
            return Err(AppError::Upstream(message));
        }

        response
            .json::<StripeIntent>()
            .await
            .map_err(|e| AppError::Upstream(format!("unreadable stripe response: {e}")))
    }
}

/// Stripe expects nested metadata as `metadata[key]=value` form fields.
fn intent_form(
    amount_minor: i64,
    currency: &str,
    metadata: &BTreeMap<String, String>,
) -> Vec<(String, String)> {
    let mut form = vec![
        ("amount".to_string(), amount_minor.to_string()),
        ("currency".to_string(), currency.to_string()),
    ];
    form.extend(
        metadata
            .iter()
            .map(|(k, v)| (format!("metadata[{k}]"), v.clone())),
    );
    form
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_payment_intent(
        &self,
        amount_minor: i64,
        currency: &str,
        metadata: &BTreeMap<String, String>,
    ) -> AppResult<PaymentIntent> {
        let url = format!("{}/v1/payment_intents", self.api_base);
        let form = intent_form(amount_minor, currency, metadata);
        let intent = self.send(self.client.post(url).form(&form)).await?;
        tracing::debug!(intent_id = %intent.id, amount_minor, "payment intent created");

        let client_secret = intent
            .client_secret
            .ok_or_else(|| AppError::Upstream("payment intent has no client secret".into()))?;
        Ok(PaymentIntent {
            id: intent.id,
            client_secret,
        })
    }

    async fn retrieve_payment_intent(&self, id: &str) -> AppResult<PaymentIntentStatus> {
        let url = format!("{}/v1/payment_intents/{}", self.api_base, id);
        let intent = self.send(self.client.get(url)).await?;
        let created_at = DateTime::<Utc>::from_timestamp(intent.created, 0).unwrap_or_else(Utc::now);
        Ok(PaymentIntentStatus {
            id: intent.id,
            status: intent.status,
            created_at,
            receipt_email: intent.receipt_email,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn form_flattens_metadata() {
        let mut metadata = BTreeMap::new();
        metadata.insert("integration_check".to_string(), "accept_a_payment".to_string());
        metadata.insert("order_id".to_string(), "abc".to_string());

        let form = intent_form(1999, "usd", &metadata);
        assert_eq!(form[0], ("amount".into(), "1999".into()));
        assert_eq!(form[1], ("currency".into(), "usd".into()));
        assert!(form.contains(&("metadata[integration_check]".into(), "accept_a_payment".into())));
        assert!(form.contains(&("metadata[order_id]".into(), "abc".into())));
    }

    #[test]
    fn api_base_trailing_slash_is_dropped() {
        let gateway = StripeGateway::new("https://api.stripe.com/", "sk_test");
        assert_eq!(gateway.api_base, "https://api.stripe.com");
    }
}
