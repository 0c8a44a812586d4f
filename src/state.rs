use std::sync::Arc;

use sea_orm::DatabaseConnection;

use crate::{payment::PaymentGateway, services::aggregate_service::AggregateRecalculator};

#[derive(Clone)]
pub struct AppState {
    pub orm: DatabaseConnection,
    pub gateway: Arc<dyn PaymentGateway>,
    pub aggregates: AggregateRecalculator,
    pub auth: AuthSettings,
    pub currency: String,
}

/// Token signing settings shared by login and the `AuthUser` extractor.
#[derive(Clone)]
pub struct AuthSettings {
    pub jwt_secret: String,
    pub jwt_ttl_hours: i64,
}
