use utoipa::{
    Modify, OpenApi,
    openapi::{
        self,
        OpenApi as OpenApiSpec,
        security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    },
};
use utoipa_scalar::{Scalar, Servable};

use crate::{
    dto::{
        auth::{
            ForgotPasswordRequest, IssuedToken, LoginRequest, LoginResponse, RegisterRequest,
            ResetPasswordRequest, VerifyEmailRequest,
        },
        orders::{
            ConfirmPaymentRequest, CreateOrderRequest, CreatedOrder, LineRequest, OrderList,
            OrderWithItems, UpdateOrderRequest,
        },
        products::{CreateProductRequest, ProductList, UpdateProductRequest},
        reviews::{CreateReviewRequest, ReviewList, UpdateReviewRequest},
        users::{AdjustPointsRequest, ChangePasswordRequest, UpdateProfileRequest, UserList},
    },
    entity::enums::{Category, OrderStatus, PaymentMethod, PaymentStatus, Provider, Role},
    models::{Address, Order, OrderItem, PaymentResult, Product, Review, User},
    response::{ApiResponse, Meta},
    routes::{admin, auth, health, orders, params, products, reviews, users},
};

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health_check,
        health::readiness_check,
        auth::register,
        auth::login,
        auth::forgot_password,
        auth::reset_password,
        auth::request_email_verification,
        auth::verify_email,
        users::get_profile,
        users::update_profile,
        users::change_password,
        users::list_referrals,
        users::referral_chain,
        users::get_user,
        users::adjust_points,
        users::delete_user,
        products::list_products,
        products::top_products,
        products::get_product,
        products::create_product,
        products::update_product,
        products::delete_product,
        reviews::list_reviews,
        reviews::create_review,
        reviews::update_review,
        reviews::delete_review,
        orders::create_order,
        orders::list_my_orders,
        orders::list_all_orders,
        orders::get_order,
        orders::pay_order,
        orders::deliver_order,
        orders::update_order,
        orders::delete_order,
        admin::recompute_aggregates
    ),
    components(
        schemas(
            User,
            Product,
            Review,
            Order,
            OrderItem,
            Address,
            PaymentResult,
            Role,
            Category,
            Provider,
            OrderStatus,
            PaymentStatus,
            PaymentMethod,
            RegisterRequest,
            LoginRequest,
            LoginResponse,
            ForgotPasswordRequest,
            ResetPasswordRequest,
            VerifyEmailRequest,
            IssuedToken,
            UpdateProfileRequest,
            ChangePasswordRequest,
            AdjustPointsRequest,
            UserList,
            CreateProductRequest,
            UpdateProductRequest,
            ProductList,
            CreateReviewRequest,
            UpdateReviewRequest,
            ReviewList,
            LineRequest,
            CreateOrderRequest,
            ConfirmPaymentRequest,
            UpdateOrderRequest,
            CreatedOrder,
            OrderWithItems,
            OrderList,
            params::Pagination,
            params::ProductQuery,
            params::OrderListQuery,
            Meta,
            ApiResponse<Product>,
            ApiResponse<ProductList>,
            ApiResponse<CreatedOrder>,
            ApiResponse<OrderWithItems>,
            ApiResponse<OrderList>,
            ApiResponse<ReviewList>,
            ApiResponse<User>,
            ApiResponse<UserList>
        )
    ),
    security(
        ("bearer_auth" = [])
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Health", description = "Health check endpoint"),
        (name = "Auth", description = "Registration, login and one-time tokens"),
        (name = "Users", description = "Profiles, referrals and points"),
        (name = "Products", description = "Gift card catalog"),
        (name = "Reviews", description = "Product reviews"),
        (name = "Orders", description = "Order lifecycle and payment"),
        (name = "Admin", description = "Maintenance endpoints"),
    )
)]
pub struct ApiDoc;

pub fn scalar_docs() -> Scalar<OpenApiSpec> {
    Scalar::with_url("/docs", ApiDoc::openapi())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_lists_order_lifecycle_paths() {
        let doc = ApiDoc::openapi();
        for path in [
            "/api/orders",
            "/api/orders/{id}/pay",
            "/api/orders/{id}/deliver",
            "/api/products/{id}/reviews",
            "/api/admin/aggregates/recompute",
        ] {
            assert!(doc.paths.paths.contains_key(path), "missing {path}");
        }
    }
}
