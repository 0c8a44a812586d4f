use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    entity::enums::{OrderStatus, PaymentMethod, PaymentStatus},
    models::{Address, Order, OrderItem},
};

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct LineRequest {
    pub product_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateOrderRequest {
    pub order_items: Vec<LineRequest>,
    pub shipping_address: Option<Address>,
    pub billing_address: Option<Address>,
    pub payment_method: PaymentMethod,
    pub provider: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ConfirmPaymentRequest {
    pub payment_intent_id: String,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct UpdateOrderRequest {
    pub status: Option<OrderStatus>,
    pub payment_status: Option<PaymentStatus>,
    pub shipping_address: Option<Address>,
    pub billing_address: Option<Address>,
    pub provider: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OrderWithItems {
    pub order: Order,
    pub items: Vec<OrderItem>,
}

/// Result of order creation: the persisted order plus the secret the client
/// needs to complete payment with the processor.
#[derive(Debug, Serialize, ToSchema)]
pub struct CreatedOrder {
    pub order: Order,
    pub items: Vec<OrderItem>,
    pub client_secret: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OrderList {
    pub items: Vec<Order>,
}
