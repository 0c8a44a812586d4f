use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[sea_orm(string_value = "user")]
    User,
    #[sea_orm(string_value = "admin")]
    Admin,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
pub enum Category {
    #[sea_orm(string_value = "Roblox")]
    Roblox,
    #[sea_orm(string_value = "Riot Games")]
    #[serde(rename = "Riot Games")]
    RiotGames,
    #[sea_orm(string_value = "PlayStation")]
    PlayStation,
    #[sea_orm(string_value = "Xbox")]
    Xbox,
    #[sea_orm(string_value = "Steam")]
    Steam,
    #[sea_orm(string_value = "Nintendo")]
    Nintendo,
    #[sea_orm(string_value = "Other")]
    Other,
}

/// Upstream supplier a product (or order) originates from.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
pub enum Provider {
    #[sea_orm(string_value = "SEAGM")]
    #[serde(rename = "SEAGM")]
    Seagm,
    #[sea_orm(string_value = "Kinguin")]
    Kinguin,
    #[sea_orm(string_value = "Digiseller")]
    Digiseller,
    #[sea_orm(string_value = "Manual")]
    Manual,
}

/// Fulfilment status, shared by orders and their line items.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "failed")]
    Failed,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "paid")]
    Paid,
    #[sea_orm(string_value = "refunded")]
    Refunded,
    #[sea_orm(string_value = "failed")]
    Failed,
}

impl PaymentStatus {
    /// Legal moves: pending -> {paid, failed}, paid -> refunded. Nothing leaves
    /// refunded or failed, and staying put is not a transition.
    pub fn can_transition_to(self, next: PaymentStatus) -> bool {
        matches!(
            (self, next),
            (PaymentStatus::Pending, PaymentStatus::Paid)
                | (PaymentStatus::Pending, PaymentStatus::Failed)
                | (PaymentStatus::Paid, PaymentStatus::Refunded)
        )
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    #[sea_orm(string_value = "stripe")]
    Stripe,
    #[sea_orm(string_value = "paypal")]
    Paypal,
    #[sea_orm(string_value = "bank_transfer")]
    BankTransfer,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_status_only_moves_forward() {
        use PaymentStatus::*;
        assert!(Pending.can_transition_to(Paid));
        assert!(Pending.can_transition_to(Failed));
        assert!(Paid.can_transition_to(Refunded));

        assert!(!Paid.can_transition_to(Pending));
        assert!(!Paid.can_transition_to(Paid));
        assert!(!Pending.can_transition_to(Refunded));
        for next in [Pending, Paid, Refunded, Failed] {
            assert!(!Refunded.can_transition_to(next));
            assert!(!Failed.can_transition_to(next));
        }
    }

    #[test]
    fn category_uses_display_names_on_the_wire() {
        let json = serde_json::to_string(&Category::RiotGames).unwrap();
        assert_eq!(json, "\"Riot Games\"");
        let parsed: Provider = serde_json::from_str("\"SEAGM\"").unwrap();
        assert_eq!(parsed, Provider::Seagm);
    }
}
