use axum::Router;

use crate::state::AppState;

pub mod admin;
pub mod auth;
pub mod doc;
pub mod health;
pub mod orders;
pub mod params;
pub mod products;
pub mod reviews;
pub mod users;

// Build the API router without binding state; it will be provided at the top level.
pub fn create_api_router() -> Router<AppState> {
    Router::new()
        .nest(
            "/products",
            products::router().merge(reviews::product_router()),
        )
        .nest("/reviews", reviews::router())
        .nest("/auth", auth::router())
        .nest("/users", users::router())
        .nest("/orders", orders::route())
        .nest("/admin", admin::router())
}
