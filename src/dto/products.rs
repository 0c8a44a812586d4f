use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{
    entity::enums::{Category, Provider},
    models::Product,
};

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateProductRequest {
    pub name: String,
    pub description: String,
    pub category: Category,
    pub price: i64,
    pub stock: i32,
    pub image: Option<String>,
    pub provider: Option<Provider>,
    pub provider_product_id: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct UpdateProductRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub category: Option<Category>,
    pub price: Option<i64>,
    pub stock: Option<i32>,
    pub image: Option<String>,
    pub provider: Option<Provider>,
    pub provider_product_id: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Serialize, ToSchema)]
#[serde(transparent)]
pub struct ProductList {
    #[schema(value_type = Vec<Product>)]
    pub items: Vec<Product>,
}
