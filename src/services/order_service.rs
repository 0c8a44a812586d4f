//! Order engine: requested lines → persisted order → verified payment → delivery.
//!
//! Stock is taken only when payment is confirmed; a pending order holds no
//! reservation. Two pending orders may compete for the last units, and the
//! one confirmed second fails with `InsufficientStock`.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::Utc;
use sea_orm::ActiveValue::NotSet;
use sea_orm::sea_query::{Expr, LockType};
use sea_orm::{
    ActiveEnum, ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseTransaction, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Select, Set, TransactionTrait,
};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    audit,
    dto::orders::{
        ConfirmPaymentRequest, CreateOrderRequest, CreatedOrder, LineRequest, OrderList,
        OrderWithItems, UpdateOrderRequest,
    },
    entity::{
        enums::{OrderStatus, PaymentStatus},
        order_items::{
            ActiveModel as OrderItemActive, Column as OrderItemCol, Entity as OrderItems,
            Model as OrderItemModel,
        },
        orders::{ActiveModel as OrderActive, Column as OrderCol, Entity as Orders, Model as OrderModel},
        products::Model as ProductModel,
    },
    error::{AppError, AppResult},
    middleware::auth::{AuthUser, ensure_admin, ensure_owner_or_admin},
    models::{Address, Order, OrderItem, PaymentResult},
    payment::INTEGRATION_CHECK,
    response::{ApiResponse, Meta},
    routes::params::{OrderListQuery, SortOrder},
    services::{account_service, aggregate_service::AffectedProducts, catalog_service},
    state::AppState,
};

/// A validated line, priced from the catalog at order time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedLine {
    pub product_id: Uuid,
    pub name: String,
    pub quantity: i32,
    pub price: i64,
    pub subtotal: i64,
}

pub async fn create_order(
    state: &AppState,
    user: &AuthUser,
    payload: CreateOrderRequest,
) -> AppResult<ApiResponse<CreatedOrder>> {
    validate_create_request(&payload)?;
    account_service::find_live_user(&state.orm, user.user_id).await?;

    let ids: Vec<Uuid> = payload
        .order_items
        .iter()
        .map(|line| line.product_id)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let products = catalog_service::get_products_by_ids(&state.orm, &ids).await?;
    let lines = plan_lines(&payload.order_items, &products)?;
    let total_price = order_total(&lines)?;

    let order_id = Uuid::new_v4();
    let metadata = BTreeMap::from([
        (INTEGRATION_CHECK.0.to_string(), INTEGRATION_CHECK.1.to_string()),
        ("order_id".to_string(), order_id.to_string()),
    ]);
    // Amounts are stored in minor units already.
    let intent = state
        .gateway
        .create_payment_intent(total_price, &state.currency, &metadata)
        .await?;

    let txn = state.orm.begin().await?;
    // Blocks a concurrent soft delete of the buyer until the order is in.
    account_service::lock_live_user(&txn, user.user_id, LockType::Share).await?;

    let order = OrderActive {
        id: Set(order_id),
        user_id: Set(user.user_id),
        total_price: Set(total_price),
        status: Set(OrderStatus::Pending),
        payment_status: Set(PaymentStatus::Pending),
        payment_method: Set(payload.payment_method),
        payment_id: Set(Some(intent.id.clone())),
        payment_result: Set(None),
        shipping_address: Set(to_json_opt(payload.shipping_address.as_ref())?),
        billing_address: Set(to_json_opt(payload.billing_address.as_ref())?),
        provider: Set(payload.provider),
        is_paid: Set(false),
        paid_at: Set(None),
        is_delivered: Set(false),
        delivered_at: Set(None),
        created_at: NotSet,
        updated_at: NotSet,
        deleted_at: Set(None),
    }
    .insert(&txn)
    .await?;

    let mut items: Vec<OrderItem> = Vec::with_capacity(lines.len());
    for line in &lines {
        let item = OrderItemActive {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            product_id: Set(line.product_id),
            name: Set(line.name.clone()),
            quantity: Set(line.quantity),
            price: Set(line.price),
            subtotal: Set(line.subtotal),
            delivery_code: Set(None),
            delivery_details: Set(None),
            status: Set(OrderStatus::Pending),
            provider_order_id: Set(None),
            created_at: NotSet,
            updated_at: NotSet,
        }
        .insert(&txn)
        .await?;
        items.push(OrderItem::from(item));
    }

    let affected = AffectedProducts::sales(ids);
    state.aggregates.within(&txn, &affected).await?;
    txn.commit().await?;
    state.aggregates.after_commit(&state.orm, &affected).await;

    tracing::info!(
        order_id = %order.id,
        user_id = %user.user_id,
        total_price,
        lines = items.len(),
        "order created"
    );
    audit::record(
        state,
        Some(user.user_id),
        "order_create",
        "orders",
        serde_json::json!({ "order_id": order.id, "payment_id": intent.id }),
    )
    .await;

    Ok(ApiResponse::success(
        "Order created",
        CreatedOrder {
            order: Order::from(order),
            items,
            client_secret: intent.client_secret,
        },
        Some(Meta::empty()),
    ))
}

/// Verify payment with the processor, then take stock for every line and
/// mark the order paid, all in one transaction. A second confirmation of the
/// same order is rejected with `InvalidState`.
pub async fn confirm_payment(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    payload: ConfirmPaymentRequest,
) -> AppResult<ApiResponse<OrderWithItems>> {
    let reference = payload.payment_intent_id.trim();
    if reference.is_empty() {
        return Err(AppError::validation("payment_intent_id is required"));
    }

    let order = find_live_order(&state.orm, id).await?;
    ensure_owner_or_admin(user, order.user_id, "order")?;
    ensure_pending(&order)?;
    if order.payment_id.as_deref().is_some_and(|known| known != reference) {
        return Err(AppError::validation(
            "Payment reference does not match this order",
        ));
    }

    let intent = state.gateway.retrieve_payment_intent(reference).await?;
    if !intent.is_succeeded() {
        if intent.is_rejected() {
            mark_payment_failed(state, id).await?;
        }
        tracing::info!(order_id = %id, status = %intent.status, "payment not completed");
        return Err(AppError::PaymentNotCompleted(intent.status));
    }

    let txn = state.orm.begin().await?;
    let order = lock_live_order(&txn, id).await?;
    ensure_pending(&order)?;

    let items = items_for_order(&txn, order.id).await?;
    for (product_id, quantity) in stock_demand(&items)? {
        // Any failure drops `txn`, which rolls back earlier decrements.
        catalog_service::decrement_stock(&txn, product_id, quantity).await?;
    }

    let now = Utc::now();
    let result = PaymentResult {
        id: intent.id.clone(),
        status: intent.status.clone(),
        update_time: intent.created_at,
        email_address: intent.receipt_email.clone(),
    };

    let mut active: OrderActive = order.into();
    active.is_paid = Set(true);
    active.paid_at = Set(Some(now.into()));
    active.payment_status = Set(PaymentStatus::Paid);
    active.status = Set(OrderStatus::Processing);
    active.payment_result = Set(Some(to_json(&result)?));
    active.updated_at = Set(now.into());
    let order = active.update(&txn).await?;
    set_item_status(&txn, order.id, OrderStatus::Processing).await?;

    let affected = AffectedProducts::sales(items.iter().map(|item| item.product_id));
    state.aggregates.within(&txn, &affected).await?;
    txn.commit().await?;
    state.aggregates.after_commit(&state.orm, &affected).await;

    tracing::info!(order_id = %order.id, payment_id = %intent.id, "order paid");
    audit::record(
        state,
        Some(user.user_id),
        "order_paid",
        "orders",
        serde_json::json!({ "order_id": order.id, "payment_id": intent.id }),
    )
    .await;

    let items = items_for_order(&state.orm, order.id)
        .await?
        .into_iter()
        .map(OrderItem::from)
        .collect();
    Ok(ApiResponse::success(
        "Payment recorded",
        OrderWithItems {
            order: Order::from(order),
            items,
        },
        Some(Meta::empty()),
    ))
}

pub async fn confirm_delivery(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<Order>> {
    ensure_admin(user)?;
    let existing = find_live_order(&state.orm, id).await?;

    let now = Utc::now();
    let mut active: OrderActive = existing.into();
    active.is_delivered = Set(true);
    active.delivered_at = Set(Some(now.into()));
    active.updated_at = Set(now.into());
    let order = active.update(&state.orm).await?;

    audit::record(
        state,
        Some(user.user_id),
        "order_delivered",
        "orders",
        serde_json::json!({ "order_id": order.id }),
    )
    .await;

    Ok(ApiResponse::success(
        "Order delivered",
        Order::from(order),
        Some(Meta::empty()),
    ))
}

pub async fn get_order(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<OrderWithItems>> {
    let order = find_live_order(&state.orm, id).await?;
    ensure_owner_or_admin(user, order.user_id, "order")?;

    let items = items_for_order(&state.orm, order.id)
        .await?
        .into_iter()
        .map(OrderItem::from)
        .collect();

    Ok(ApiResponse::success(
        "OK",
        OrderWithItems {
            order: Order::from(order),
            items,
        },
        Some(Meta::empty()),
    ))
}

pub async fn list_my_orders(
    state: &AppState,
    user: &AuthUser,
    query: OrderListQuery,
) -> AppResult<ApiResponse<OrderList>> {
    let condition = Condition::all().add(OrderCol::UserId.eq(user.user_id));
    list_orders_where(state, condition, query, "Ok").await
}

pub async fn list_all_orders(
    state: &AppState,
    user: &AuthUser,
    query: OrderListQuery,
) -> AppResult<ApiResponse<OrderList>> {
    ensure_admin(user)?;
    list_orders_where(state, Condition::all(), query, "Orders").await
}

/// Admin edit. Line items and their prices are frozen at creation, so the
/// total can never drift; payment status may only move along legal
/// transitions and never to `paid` (that goes through confirmation).
pub async fn update_order(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    payload: UpdateOrderRequest,
) -> AppResult<ApiResponse<OrderWithItems>> {
    ensure_admin(user)?;
    for address in [&payload.shipping_address, &payload.billing_address]
        .into_iter()
        .flatten()
    {
        ensure_complete_address(address)?;
    }

    let txn = state.orm.begin().await?;
    let existing = lock_live_order(&txn, id).await?;
    let previous_payment = existing.payment_status;

    let mut active: OrderActive = existing.into();
    if let Some(next) = payload.payment_status {
        check_admin_payment_transition(previous_payment, next)?;
        active.payment_status = Set(next);
    }
    if let Some(status) = payload.status {
        active.status = Set(status);
    }
    if let Some(address) = payload.shipping_address.as_ref() {
        active.shipping_address = Set(Some(to_json(address)?));
    }
    if let Some(address) = payload.billing_address.as_ref() {
        active.billing_address = Set(Some(to_json(address)?));
    }
    if let Some(provider) = payload.provider {
        active.provider = Set(Some(provider));
    }
    active.updated_at = Set(Utc::now().into());
    let order = active.update(&txn).await?;

    if let Some(status) = payload.status {
        set_item_status(&txn, order.id, status).await?;
    }

    let items = items_for_order(&txn, order.id).await?;
    let affected = if order.payment_status != previous_payment {
        AffectedProducts::sales(items.iter().map(|item| item.product_id))
    } else {
        AffectedProducts::default()
    };
    state.aggregates.within(&txn, &affected).await?;
    txn.commit().await?;
    state.aggregates.after_commit(&state.orm, &affected).await;

    audit::record(
        state,
        Some(user.user_id),
        "order_update",
        "orders",
        serde_json::json!({
            "order_id": order.id,
            "status": order.status,
            "payment_status": order.payment_status,
        }),
    )
    .await;

    Ok(ApiResponse::success(
        "Order updated",
        OrderWithItems {
            order: Order::from(order),
            items: items.into_iter().map(OrderItem::from).collect(),
        },
        Some(Meta::empty()),
    ))
}

/// Soft delete; sales for the order's products are recomputed without it.
pub async fn delete_order(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<serde_json::Value>> {
    ensure_admin(user)?;

    let txn = state.orm.begin().await?;
    let existing = lock_live_order(&txn, id).await?;
    let items = items_for_order(&txn, existing.id).await?;

    let now = Utc::now();
    let mut active: OrderActive = existing.into();
    active.deleted_at = Set(Some(now.into()));
    active.updated_at = Set(now.into());
    active.update(&txn).await?;

    let affected = AffectedProducts::sales(items.iter().map(|item| item.product_id));
    state.aggregates.within(&txn, &affected).await?;
    txn.commit().await?;
    state.aggregates.after_commit(&state.orm, &affected).await;

    tracing::info!(order_id = %id, "order deleted");
    audit::record(
        state,
        Some(user.user_id),
        "order_delete",
        "orders",
        serde_json::json!({ "order_id": id }),
    )
    .await;

    Ok(ApiResponse::success(
        "Deleted",
        serde_json::json!({}),
        Some(Meta::empty()),
    ))
}

async fn list_orders_where(
    state: &AppState,
    condition: Condition,
    query: OrderListQuery,
    message: &str,
) -> AppResult<ApiResponse<OrderList>> {
    let (page, limit, offset) = query.pagination().normalize();
    let mut condition = condition.add(OrderCol::DeletedAt.is_null());
    if let Some(status) = query.status {
        condition = condition.add(OrderCol::Status.eq(status));
    }
    if let Some(payment_status) = query.payment_status {
        condition = condition.add(OrderCol::PaymentStatus.eq(payment_status));
    }

    let mut finder = Orders::find().filter(condition);
    finder = match query.sort_order.unwrap_or(SortOrder::Desc) {
        SortOrder::Asc => finder.order_by_asc(OrderCol::CreatedAt),
        SortOrder::Desc => finder.order_by_desc(OrderCol::CreatedAt),
    };

    let total = finder.clone().count(&state.orm).await? as i64;

    let orders = finder
        .limit(limit as u64)
        .offset(offset as u64)
        .all(&state.orm)
        .await?
        .into_iter()
        .map(Order::from)
        .collect();

    let meta = Meta::new(page, limit, total);
    Ok(ApiResponse::success(
        message,
        OrderList { items: orders },
        Some(meta),
    ))
}

/// Processor rejected the intent: pending -> failed, if still pending.
async fn mark_payment_failed(state: &AppState, id: Uuid) -> AppResult<()> {
    let txn = state.orm.begin().await?;
    let order = lock_live_order(&txn, id).await?;
    if order.payment_status != PaymentStatus::Pending {
        return Ok(());
    }
    let mut active: OrderActive = order.into();
    active.payment_status = Set(PaymentStatus::Failed);
    active.status = Set(OrderStatus::Failed);
    active.updated_at = Set(Utc::now().into());
    active.update(&txn).await?;
    set_item_status(&txn, id, OrderStatus::Failed).await?;
    txn.commit().await?;
    tracing::info!(order_id = %id, "payment rejected by processor");
    Ok(())
}

fn live_order(id: Uuid) -> Select<Orders> {
    Orders::find_by_id(id).filter(OrderCol::DeletedAt.is_null())
}

async fn find_live_order<C: ConnectionTrait>(conn: &C, id: Uuid) -> AppResult<OrderModel> {
    live_order(id)
        .one(conn)
        .await?
        .ok_or_else(|| AppError::not_found("Order"))
}

/// Row lock serialises every writer of the same order.
async fn lock_live_order(txn: &DatabaseTransaction, id: Uuid) -> AppResult<OrderModel> {
    live_order(id)
        .lock(LockType::Update)
        .one(txn)
        .await?
        .ok_or_else(|| AppError::not_found("Order"))
}

async fn items_for_order<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> AppResult<Vec<OrderItemModel>> {
    let items = OrderItems::find()
        .filter(OrderItemCol::OrderId.eq(order_id))
        .order_by_asc(OrderItemCol::CreatedAt)
        .order_by_asc(OrderItemCol::Id)
        .all(conn)
        .await?;
    Ok(items)
}

async fn set_item_status<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    status: OrderStatus,
) -> AppResult<()> {
    OrderItems::update_many()
        .col_expr(OrderItemCol::Status, Expr::value(status))
        .col_expr(OrderItemCol::UpdatedAt, Expr::value(Utc::now()))
        .filter(OrderItemCol::OrderId.eq(order_id))
        .exec(conn)
        .await?;
    Ok(())
}

fn ensure_pending(order: &OrderModel) -> AppResult<()> {
    match order.payment_status {
        PaymentStatus::Pending => Ok(()),
        PaymentStatus::Paid => Err(AppError::InvalidState("Order already paid".into())),
        other => Err(AppError::InvalidState(format!(
            "Order payment is {}",
            other.to_value()
        ))),
    }
}

fn check_admin_payment_transition(current: PaymentStatus, next: PaymentStatus) -> AppResult<()> {
    if current == next {
        return Ok(());
    }
    if next == PaymentStatus::Paid {
        return Err(AppError::InvalidState(
            "Orders become paid only through payment confirmation".into(),
        ));
    }
    if !current.can_transition_to(next) {
        return Err(AppError::InvalidState(format!(
            "Payment status cannot move from {current:?} to {next:?}"
        )));
    }
    Ok(())
}

fn ensure_complete_address(address: &Address) -> AppResult<()> {
    if address.is_complete() {
        Ok(())
    } else {
        Err(AppError::validation(
            "Address needs address, city, postal_code and country",
        ))
    }
}

fn validate_create_request(payload: &CreateOrderRequest) -> AppResult<()> {
    if payload.order_items.is_empty() {
        return Err(AppError::validation("No order items"));
    }
    if payload.order_items.iter().any(|line| line.quantity < 1) {
        return Err(AppError::validation("Quantity must be at least 1"));
    }
    for address in [&payload.shipping_address, &payload.billing_address]
        .into_iter()
        .flatten()
    {
        ensure_complete_address(address)?;
    }
    Ok(())
}

/// Resolve every requested line against the batch of fetched products.
/// Fails on the first missing/inactive product or on the first product whose
/// stock cannot cover the total quantity requested for it.
pub fn plan_lines(lines: &[LineRequest], products: &[ProductModel]) -> AppResult<Vec<PlannedLine>> {
    let by_id: HashMap<Uuid, &ProductModel> = products.iter().map(|p| (p.id, p)).collect();
    let mut requested: HashMap<Uuid, i32> = HashMap::new();
    let mut planned = Vec::with_capacity(lines.len());

    for line in lines {
        let product = by_id
            .get(&line.product_id)
            .filter(|p| p.is_active && p.deleted_at.is_none())
            .ok_or_else(|| AppError::NotFound(format!("Product {}", line.product_id)))?;

        let wanted = requested.entry(product.id).or_insert(0);
        *wanted = wanted
            .checked_add(line.quantity)
            .ok_or_else(|| AppError::validation("Quantity too large"))?;
        if product.stock < *wanted {
            return Err(AppError::InsufficientStock {
                product_id: product.id,
                product: product.name.clone(),
                available: product.stock,
                requested: *wanted,
            });
        }

        let subtotal = product
            .price
            .checked_mul(i64::from(line.quantity))
            .ok_or_else(|| AppError::validation("Line total too large"))?;
        planned.push(PlannedLine {
            product_id: product.id,
            name: product.name.clone(),
            quantity: line.quantity,
            price: product.price,
            subtotal,
        });
    }
    Ok(planned)
}

pub fn order_total(lines: &[PlannedLine]) -> AppResult<i64> {
    lines.iter().try_fold(0_i64, |acc, line| {
        acc.checked_add(line.subtotal)
            .ok_or_else(|| AppError::validation("Order total too large"))
    })
}

/// Quantity to take per product, in product-id order so that concurrent
/// confirmations always lock rows in the same sequence.
pub fn stock_demand(items: &[OrderItemModel]) -> AppResult<BTreeMap<Uuid, i32>> {
    let mut demand: BTreeMap<Uuid, i32> = BTreeMap::new();
    for item in items {
        let entry = demand.entry(item.product_id).or_insert(0);
        *entry = entry
            .checked_add(item.quantity)
            .ok_or_else(|| AppError::validation("Quantity too large"))?;
    }
    Ok(demand)
}

fn to_json<T: Serialize>(value: &T) -> AppResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| AppError::Internal(e.into()))
}

fn to_json_opt<T: Serialize>(value: Option<&T>) -> AppResult<Option<serde_json::Value>> {
    value.map(to_json).transpose()
}
