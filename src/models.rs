use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::entity::{
    enums::{Category, OrderStatus, PaymentMethod, PaymentStatus, Provider, Role},
    order_items::Model as OrderItemModel,
    orders::Model as OrderModel,
    products::Model as ProductModel,
    reviews::Model as ReviewModel,
    users::Model as UserModel,
};

/// Public view of an account. The credential hash and the one-time tokens
/// never leave the service.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub referral_code: String,
    pub referred_by_id: Option<Uuid>,
    pub points: i32,
    pub is_email_verified: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub category: Category,
    pub price: i64,
    pub stock: i32,
    pub image: String,
    pub provider: Provider,
    pub provider_product_id: Option<String>,
    pub is_active: bool,
    pub average_rating: Option<f64>,
    pub num_reviews: i32,
    pub total_sales: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Address {
    pub address: String,
    pub city: String,
    pub postal_code: String,
    pub country: String,
}

impl Address {
    pub fn is_complete(&self) -> bool {
        [&self.address, &self.city, &self.postal_code, &self.country]
            .iter()
            .all(|field| !field.trim().is_empty())
    }
}

/// Settlement details copied from the processor when payment is confirmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PaymentResult {
    pub id: String,
    pub status: String,
    pub update_time: DateTime<Utc>,
    pub email_address: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    pub total_price: i64,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub payment_method: PaymentMethod,
    pub payment_id: Option<String>,
    pub payment_result: Option<PaymentResult>,
    pub shipping_address: Option<Address>,
    pub billing_address: Option<Address>,
    pub provider: Option<String>,
    pub is_paid: bool,
    pub paid_at: Option<DateTime<Utc>>,
    pub is_delivered: bool,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct OrderItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub name: String,
    pub quantity: i32,
    pub price: i64,
    pub subtotal: i64,
    pub delivery_code: Option<String>,
    pub delivery_details: Option<String>,
    pub status: OrderStatus,
    pub provider_order_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct Review {
    pub id: Uuid,
    pub user_id: Uuid,
    pub product_id: Uuid,
    pub rating: i32,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<UserModel> for User {
    fn from(model: UserModel) -> Self {
        User {
            id: model.id,
            name: model.name,
            email: model.email,
            role: model.role,
            referral_code: model.referral_code,
            referred_by_id: model.referred_by_id,
            points: model.points,
            is_email_verified: model.is_email_verified,
            created_at: model.created_at.with_timezone(&Utc),
        }
    }
}

impl From<ProductModel> for Product {
    fn from(model: ProductModel) -> Self {
        Product {
            id: model.id,
            name: model.name,
            description: model.description,
            category: model.category,
            price: model.price,
            stock: model.stock,
            image: model.image,
            provider: model.provider,
            provider_product_id: model.provider_product_id,
            is_active: model.is_active,
            average_rating: model.average_rating,
            num_reviews: model.num_reviews,
            total_sales: model.total_sales,
            created_at: model.created_at.with_timezone(&Utc),
            updated_at: model.updated_at.with_timezone(&Utc),
        }
    }
}

impl From<OrderModel> for Order {
    fn from(model: OrderModel) -> Self {
        // Blobs written by this service always round-trip; anything else is dropped.
        let decode_address =
            |value: Option<serde_json::Value>| value.and_then(|v| serde_json::from_value(v).ok());
        Order {
            id: model.id,
            user_id: model.user_id,
            total_price: model.total_price,
            status: model.status,
            payment_status: model.payment_status,
            payment_method: model.payment_method,
            payment_id: model.payment_id,
            payment_result: model
                .payment_result
                .and_then(|v| serde_json::from_value(v).ok()),
            shipping_address: decode_address(model.shipping_address),
            billing_address: decode_address(model.billing_address),
            provider: model.provider,
            is_paid: model.is_paid,
            paid_at: model.paid_at.map(|dt| dt.with_timezone(&Utc)),
            is_delivered: model.is_delivered,
            delivered_at: model.delivered_at.map(|dt| dt.with_timezone(&Utc)),
            created_at: model.created_at.with_timezone(&Utc),
            updated_at: model.updated_at.with_timezone(&Utc),
        }
    }
}

impl From<OrderItemModel> for OrderItem {
    fn from(model: OrderItemModel) -> Self {
        OrderItem {
            id: model.id,
            order_id: model.order_id,
            product_id: model.product_id,
            name: model.name,
            quantity: model.quantity,
            price: model.price,
            subtotal: model.subtotal,
            delivery_code: model.delivery_code,
            delivery_details: model.delivery_details,
            status: model.status,
            provider_order_id: model.provider_order_id,
            created_at: model.created_at.with_timezone(&Utc),
        }
    }
}

impl From<ReviewModel> for Review {
    fn from(model: ReviewModel) -> Self {
        Review {
            id: model.id,
            user_id: model.user_id,
            product_id: model.product_id,
            rating: model.rating,
            comment: model.comment,
            created_at: model.created_at.with_timezone(&Utc),
            updated_at: model.updated_at.with_timezone(&Utc),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_requires_every_field() {
        let mut address = Address {
            address: "1 Main St".into(),
            city: "Paris".into(),
            postal_code: "75001".into(),
            country: "FR".into(),
        };
        assert!(address.is_complete());
        address.city = "  ".into();
        assert!(!address.is_complete());
    }
}
