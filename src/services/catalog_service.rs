use chrono::Utc;
use sea_orm::ActiveValue::NotSet;
use sea_orm::sea_query::{Expr, Func, NullOrdering, Order};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set,
};
use uuid::Uuid;

use crate::dto::products::{CreateProductRequest, ProductList, UpdateProductRequest};
use crate::{
    audit,
    entity::{
        enums::Provider,
        products::{ActiveModel, Column, Entity as Products, Model as ProductModel},
    },
    error::{AppError, AppResult},
    middleware::auth::{AuthUser, ensure_admin},
    models::Product,
    response::{ApiResponse, Meta},
    routes::params::{ProductQuery, ProductSortBy, SortOrder},
    services::aggregate_service::RatingSummary,
    state::AppState,
};

const TOP_PRODUCTS_LIMIT: u64 = 5;

/// Partial write of the derived fields. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateUpdate {
    pub total_sales: Option<i64>,
    pub rating: Option<RatingSummary>,
}

pub async fn list_products(
    state: &AppState,
    query: ProductQuery,
) -> AppResult<ApiResponse<ProductList>> {
    let (page, limit, offset) = query.pagination().normalize();
    let mut condition = Condition::all()
        .add(Column::DeletedAt.is_null())
        .add(Column::IsActive.eq(true));
    if let Some(q) = query.q.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
        let pattern = format!("%{}%", q.to_lowercase());
        condition = condition.add(
            Condition::any()
                .add(Expr::expr(Func::lower(Expr::col(Column::Name))).like(pattern.as_str()))
                .add(Expr::expr(Func::lower(Expr::col(Column::Description))).like(pattern.as_str())),
        );
    }
    if let Some(category) = query.category {
        condition = condition.add(Column::Category.eq(category));
    }
    if let Some(min_price) = query.min_price {
        condition = condition.add(Column::Price.gte(min_price));
    }
    if let Some(max_price) = query.max_price {
        condition = condition.add(Column::Price.lte(max_price));
    }

    let sort_by = query.sort_by.unwrap_or(ProductSortBy::CreatedAt);
    let sort_order = query.sort_order.unwrap_or(SortOrder::Desc);
    let sort_col = match sort_by {
        ProductSortBy::CreatedAt => Column::CreatedAt,
        ProductSortBy::Price => Column::Price,
        ProductSortBy::Name => Column::Name,
        ProductSortBy::Rating => Column::AverageRating,
        ProductSortBy::Sales => Column::TotalSales,
    };

    let mut finder = Products::find().filter(condition);
    finder = match sort_order {
        SortOrder::Asc => finder.order_by_with_nulls(sort_col, Order::Asc, NullOrdering::Last),
        SortOrder::Desc => finder.order_by_with_nulls(sort_col, Order::Desc, NullOrdering::Last),
    };

    let total = finder.clone().count(&state.orm).await? as i64;

    let items = finder
        .limit(limit as u64)
        .offset(offset as u64)
        .all(&state.orm)
        .await?
        .into_iter()
        .map(Product::from)
        .collect();

    let meta = Meta::new(page, limit, total);
    Ok(ApiResponse::success("Products", ProductList { items }, Some(meta)))
}

/// Best rated live products; unrated ones sort last.
pub async fn list_top_products(state: &AppState) -> AppResult<ApiResponse<ProductList>> {
    let items = Products::find()
        .filter(Column::DeletedAt.is_null())
        .filter(Column::IsActive.eq(true))
        .order_by_with_nulls(Column::AverageRating, Order::Desc, NullOrdering::Last)
        .order_by_desc(Column::NumReviews)
        .limit(TOP_PRODUCTS_LIMIT)
        .all(&state.orm)
        .await?
        .into_iter()
        .map(Product::from)
        .collect();
    Ok(ApiResponse::success(
        "Top products",
        ProductList { items },
        Some(Meta::empty()),
    ))
}

pub async fn get_product(state: &AppState, id: Uuid) -> AppResult<ApiResponse<Product>> {
    let product = find_live(&state.orm, id).await?;
    Ok(ApiResponse::success("Product", Product::from(product), None))
}

pub async fn create_product(
    state: &AppState,
    user: &AuthUser,
    payload: CreateProductRequest,
) -> AppResult<ApiResponse<Product>> {
    ensure_admin(user)?;
    validate_product_fields(
        Some(&payload.name),
        Some(&payload.description),
        Some(payload.price),
        Some(payload.stock),
    )?;

    let active = ActiveModel {
        id: Set(Uuid::new_v4()),
        name: Set(payload.name.trim().to_string()),
        description: Set(payload.description.trim().to_string()),
        category: Set(payload.category),
        price: Set(payload.price),
        stock: Set(payload.stock),
        image: Set(payload.image.unwrap_or_else(|| "no-photo.jpg".to_string())),
        provider: Set(payload.provider.unwrap_or(Provider::Manual)),
        provider_product_id: Set(payload.provider_product_id),
        is_active: Set(payload.is_active.unwrap_or(true)),
        average_rating: Set(None),
        num_reviews: Set(0),
        total_sales: Set(0),
        created_at: NotSet,
        updated_at: NotSet,
        deleted_at: Set(None),
    };
    let product = active.insert(&state.orm).await?;
    tracing::info!(product_id = %product.id, "product created");

    audit::record(
        state,
        Some(user.user_id),
        "product_create",
        "products",
        serde_json::json!({ "product_id": product.id }),
    )
    .await;

    Ok(ApiResponse::success(
        "Product created",
        Product::from(product),
        Some(Meta::empty()),
    ))
}

/// Catalog edits never touch `total_sales`, `average_rating` or `num_reviews`.
pub async fn update_product(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    payload: UpdateProductRequest,
) -> AppResult<ApiResponse<Product>> {
    ensure_admin(user)?;
    validate_product_fields(
        payload.name.as_deref(),
        payload.description.as_deref(),
        payload.price,
        payload.stock,
    )?;
    let existing = find_live(&state.orm, id).await?;

    let mut active: ActiveModel = existing.into();
    if let Some(name) = payload.name {
        active.name = Set(name.trim().to_string());
    }
    if let Some(description) = payload.description {
        active.description = Set(description.trim().to_string());
    }
    if let Some(category) = payload.category {
        active.category = Set(category);
    }
    if let Some(price) = payload.price {
        active.price = Set(price);
    }
    if let Some(stock) = payload.stock {
        active.stock = Set(stock);
    }
    if let Some(image) = payload.image {
        active.image = Set(image);
    }
    if let Some(provider) = payload.provider {
        active.provider = Set(provider);
    }
    if let Some(provider_product_id) = payload.provider_product_id {
        active.provider_product_id = Set(Some(provider_product_id));
    }
    if let Some(is_active) = payload.is_active {
        active.is_active = Set(is_active);
    }
    active.updated_at = Set(Utc::now().into());

    let product = active.update(&state.orm).await?;

    audit::record(
        state,
        Some(user.user_id),
        "product_update",
        "products",
        serde_json::json!({ "product_id": product.id }),
    )
    .await;

    Ok(ApiResponse::success(
        "Updated",
        Product::from(product),
        Some(Meta::empty()),
    ))
}

/// Soft delete. Line items keep pointing at the row, so history survives.
pub async fn delete_product(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<serde_json::Value>> {
    ensure_admin(user)?;
    let now = Utc::now();
    let result = Products::update_many()
        .col_expr(Column::DeletedAt, Expr::value(now))
        .col_expr(Column::IsActive, Expr::value(false))
        .col_expr(Column::UpdatedAt, Expr::value(now))
        .filter(Column::Id.eq(id))
        .filter(Column::DeletedAt.is_null())
        .exec(&state.orm)
        .await?;

    if result.rows_affected == 0 {
        return Err(AppError::not_found("Product"));
    }

    audit::record(
        state,
        Some(user.user_id),
        "product_delete",
        "products",
        serde_json::json!({ "product_id": id }),
    )
    .await;

    Ok(ApiResponse::success(
        "Deleted",
        serde_json::json!({}),
        Some(Meta::empty()),
    ))
}

/// Batch fetch of non-deleted products. Missing ids are simply absent from
/// the result; callers decide whether that is an error.
pub async fn get_products_by_ids<C: ConnectionTrait>(
    conn: &C,
    ids: &[Uuid],
) -> AppResult<Vec<ProductModel>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let products = Products::find()
        .filter(Column::Id.is_in(ids.iter().copied()))
        .filter(Column::DeletedAt.is_null())
        .all(conn)
        .await?;
    Ok(products)
}

/// Atomic read-check-write: the guard `stock >= qty` is evaluated under the
/// row lock taken by the UPDATE, so concurrent decrements can never drive the
/// balance negative. The loser gets `InsufficientStock`.
pub async fn decrement_stock<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
    quantity: i32,
) -> AppResult<()> {
    if quantity < 1 {
        return Err(AppError::validation("Quantity must be at least 1"));
    }
    let result = Products::update_many()
        .col_expr(Column::Stock, Expr::col(Column::Stock).sub(quantity))
        .col_expr(Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(Column::Id.eq(product_id))
        .filter(Column::Stock.gte(quantity))
        .exec(conn)
        .await?;

    if result.rows_affected == 1 {
        return Ok(());
    }

    let product = Products::find_by_id(product_id)
        .one(conn)
        .await?
        .ok_or_else(|| AppError::not_found("Product"))?;
    tracing::info!(
        %product_id,
        available = product.stock,
        requested = quantity,
        "stock decrement rejected"
    );
    Err(AppError::InsufficientStock {
        product_id,
        product: product.name,
        available: product.stock,
        requested: quantity,
    })
}

/// Only the recalculator calls this.
pub async fn update_aggregates<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
    update: &AggregateUpdate,
) -> AppResult<()> {
    if update.total_sales.is_none() && update.rating.is_none() {
        return Ok(());
    }
    let mut query = Products::update_many().filter(Column::Id.eq(product_id));
    if let Some(total_sales) = update.total_sales {
        query = query.col_expr(Column::TotalSales, Expr::value(total_sales));
    }
    if let Some(rating) = update.rating {
        query = query
            .col_expr(Column::AverageRating, Expr::value(rating.average_rating))
            .col_expr(Column::NumReviews, Expr::value(rating.num_reviews));
    }
    query.exec(conn).await?;
    Ok(())
}

pub async fn find_live<C: ConnectionTrait>(conn: &C, id: Uuid) -> AppResult<ProductModel> {
    Products::find_by_id(id)
        .filter(Column::DeletedAt.is_null())
        .one(conn)
        .await?
        .ok_or_else(|| AppError::not_found("Product"))
}

fn validate_product_fields(
    name: Option<&str>,
    description: Option<&str>,
    price: Option<i64>,
    stock: Option<i32>,
) -> AppResult<()> {
    if let Some(name) = name {
        let len = name.trim().chars().count();
        if len == 0 || len > 100 {
            return Err(AppError::validation("Name must be 1 to 100 characters"));
        }
    }
    if let Some(description) = description {
        let len = description.trim().chars().count();
        if len == 0 || len > 500 {
            return Err(AppError::validation(
                "Description must be 1 to 500 characters",
            ));
        }
    }
    if price.is_some_and(|p| p < 0) {
        return Err(AppError::validation("Price must be at least 0"));
    }
    if stock.is_some_and(|s| s < 0) {
        return Err(AppError::validation("Stock cannot be negative"));
    }
    Ok(())
}
