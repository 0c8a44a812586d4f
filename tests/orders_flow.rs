mod common;

use giftcard_storefront::{
    dto::orders::{ConfirmPaymentRequest, UpdateOrderRequest},
    entity::{
        enums::{OrderStatus, PaymentStatus, Role},
        order_items::{Column as OrderItemCol, Entity as OrderItems},
        orders::{Column as OrderCol, Entity as Orders},
        products::{Column as ProductCol, Entity as Products},
    },
    error::AppError,
    services::{aggregate_service::{AggregateRecalculator, RecomputePolicy}, order_service},
};
use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, sea_query::Expr};
use tokio::task::JoinSet;

use common::{create_product, create_user, order_request, reload_product, setup, setup_with};

fn confirm(reference: &str) -> ConfirmPaymentRequest {
    ConfirmPaymentRequest {
        payment_intent_id: reference.to_string(),
    }
}

#[tokio::test]
async fn create_prices_lines_from_catalog_and_takes_no_stock() -> anyhow::Result<()> {
    let Some((state, gateway)) = setup().await? else {
        return Ok(());
    };
    let buyer = create_user(&state, Role::User).await?;
    let steam = create_product(&state, 2000, 10).await?;
    let robux = create_product(&state, 999, 4).await?;

    let created = order_service::create_order(
        &state,
        &buyer,
        order_request(&[(steam.id, 2), (robux.id, 3)]),
    )
    .await?
    .data
    .expect("created order");

    let order = &created.order;
    assert_eq!(order.total_price, 2 * 2000 + 3 * 999);
    assert_eq!(
        order.total_price,
        created.items.iter().map(|item| item.subtotal).sum::<i64>()
    );
    for item in &created.items {
        assert_eq!(item.subtotal, item.price * i64::from(item.quantity));
    }
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.payment_status, PaymentStatus::Pending);
    assert!(!order.is_paid);

    let payment_id = order.payment_id.clone().expect("payment id");
    assert_eq!(gateway.amount_of(&payment_id), Some(order.total_price));
    assert!(created.client_secret.starts_with(&payment_id));

    assert_eq!(reload_product(&state, steam.id).await?.stock, 10);
    assert_eq!(reload_product(&state, robux.id).await?.stock, 4);
    Ok(())
}

#[tokio::test]
async fn insufficient_stock_at_creation_writes_nothing() -> anyhow::Result<()> {
    let Some((state, _gateway)) = setup().await? else {
        return Ok(());
    };
    let buyer = create_user(&state, Role::User).await?;
    let product = create_product(&state, 1000, 3).await?;

    // Two lines for the same product: the check is on the combined quantity.
    let err = order_service::create_order(
        &state,
        &buyer,
        order_request(&[(product.id, 2), (product.id, 2)]),
    )
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        AppError::InsufficientStock { available: 3, requested: 4, .. }
    ));

    let orders = Orders::find()
        .filter(OrderCol::UserId.eq(buyer.user_id))
        .count(&state.orm)
        .await?;
    assert_eq!(orders, 0);
    let items = OrderItems::find()
        .filter(OrderItemCol::ProductId.eq(product.id))
        .count(&state.orm)
        .await?;
    assert_eq!(items, 0);
    assert_eq!(reload_product(&state, product.id).await?.stock, 3);
    Ok(())
}

#[tokio::test]
async fn confirmation_takes_stock_once_and_drives_total_sales() -> anyhow::Result<()> {
    let Some((state, gateway)) = setup().await? else {
        return Ok(());
    };
    let buyer = create_user(&state, Role::User).await?;
    let admin = create_user(&state, Role::Admin).await?;
    let product = create_product(&state, 1500, 10).await?;

    let created = order_service::create_order(&state, &buyer, order_request(&[(product.id, 3)]))
        .await?
        .data
        .expect("created order");
    let order_id = created.order.id;
    let payment_id = created.order.payment_id.clone().expect("payment id");

    // Not yet settled at the processor.
    let err = order_service::confirm_payment(&state, &buyer, order_id, confirm(&payment_id))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PaymentNotCompleted(_)));
    assert_eq!(reload_product(&state, product.id).await?.stock, 10);

    // A reference that belongs to some other intent is refused.
    let err = order_service::confirm_payment(&state, &buyer, order_id, confirm("pi_other"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    gateway.set_status(&payment_id, "succeeded");
    let paid = order_service::confirm_payment(&state, &buyer, order_id, confirm(&payment_id))
        .await?
        .data
        .expect("paid order");
    assert!(paid.order.is_paid);
    assert!(paid.order.paid_at.is_some());
    assert_eq!(paid.order.payment_status, PaymentStatus::Paid);
    assert_eq!(paid.order.status, OrderStatus::Processing);
    assert!(paid.items.iter().all(|item| item.status == OrderStatus::Processing));
    assert_eq!(
        paid.order.payment_result.as_ref().map(|r| r.status.as_str()),
        Some("succeeded")
    );

    let after = reload_product(&state, product.id).await?;
    assert_eq!(after.stock, 7);
    assert_eq!(after.total_sales, 3);

    // Second confirmation is rejected and takes nothing.
    let err = order_service::confirm_payment(&state, &buyer, order_id, confirm(&payment_id))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));
    assert_eq!(reload_product(&state, product.id).await?.stock, 7);

    let delivered = order_service::confirm_delivery(&state, &admin, order_id)
        .await?
        .data
        .expect("delivered order");
    assert!(delivered.is_delivered);
    assert!(delivered.delivered_at.is_some());

    // Soft delete removes the order from the sales aggregate.
    order_service::delete_order(&state, &admin, order_id).await?;
    assert_eq!(reload_product(&state, product.id).await?.total_sales, 0);
    let err = order_service::get_order(&state, &admin, order_id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
    Ok(())
}

#[tokio::test]
async fn refund_through_admin_update_lowers_total_sales() -> anyhow::Result<()> {
    let Some((state, gateway)) =
        setup_with(AggregateRecalculator::new(RecomputePolicy::InTransaction, 0)).await?
    else {
        return Ok(());
    };
    let buyer = create_user(&state, Role::User).await?;
    let admin = create_user(&state, Role::Admin).await?;
    let product = create_product(&state, 500, 10).await?;

    let created = order_service::create_order(&state, &buyer, order_request(&[(product.id, 4)]))
        .await?
        .data
        .expect("created order");
    let payment_id = created.order.payment_id.clone().expect("payment id");
    gateway.set_status(&payment_id, "succeeded");
    order_service::confirm_payment(&state, &buyer, created.order.id, confirm(&payment_id)).await?;
    assert_eq!(reload_product(&state, product.id).await?.total_sales, 4);

    // Only the admin may edit, and `paid` cannot be set by hand.
    let err = order_service::update_order(
        &state,
        &buyer,
        created.order.id,
        UpdateOrderRequest {
            payment_status: Some(PaymentStatus::Refunded),
            ..Default::default()
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::Forbidden));

    let updated = order_service::update_order(
        &state,
        &admin,
        created.order.id,
        UpdateOrderRequest {
            payment_status: Some(PaymentStatus::Refunded),
            ..Default::default()
        },
    )
    .await?
    .data
    .expect("updated order");
    assert_eq!(updated.order.payment_status, PaymentStatus::Refunded);
    assert_eq!(updated.order.total_price, 4 * 500);
    assert_eq!(reload_product(&state, product.id).await?.total_sales, 0);

    let err = order_service::update_order(
        &state,
        &admin,
        created.order.id,
        UpdateOrderRequest {
            payment_status: Some(PaymentStatus::Paid),
            ..Default::default()
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));
    Ok(())
}

#[tokio::test]
async fn canceled_intent_fails_the_order() -> anyhow::Result<()> {
    let Some((state, gateway)) = setup().await? else {
        return Ok(());
    };
    let buyer = create_user(&state, Role::User).await?;
    let product = create_product(&state, 700, 5).await?;

    let created = order_service::create_order(&state, &buyer, order_request(&[(product.id, 1)]))
        .await?
        .data
        .expect("created order");
    let payment_id = created.order.payment_id.clone().expect("payment id");
    gateway.set_status(&payment_id, "canceled");

    let err = order_service::confirm_payment(&state, &buyer, created.order.id, confirm(&payment_id))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PaymentNotCompleted(_)));

    let order = order_service::get_order(&state, &buyer, created.order.id)
        .await?
        .data
        .expect("order");
    assert_eq!(order.order.payment_status, PaymentStatus::Failed);
    assert_eq!(order.order.status, OrderStatus::Failed);
    assert!(order.items.iter().all(|item| item.status == OrderStatus::Failed));
    assert_eq!(reload_product(&state, product.id).await?.stock, 5);
    Ok(())
}

#[tokio::test]
async fn other_users_get_unauthorized_not_not_found() -> anyhow::Result<()> {
    let Some((state, gateway)) = setup().await? else {
        return Ok(());
    };
    let owner = create_user(&state, Role::User).await?;
    let stranger = create_user(&state, Role::User).await?;
    let admin = create_user(&state, Role::Admin).await?;
    let product = create_product(&state, 1000, 5).await?;

    let created = order_service::create_order(&state, &owner, order_request(&[(product.id, 1)]))
        .await?
        .data
        .expect("created order");
    let payment_id = created.order.payment_id.clone().expect("payment id");
    gateway.set_status(&payment_id, "succeeded");

    let err = order_service::get_order(&state, &stranger, created.order.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Unauthorized(_)));

    let err =
        order_service::confirm_payment(&state, &stranger, created.order.id, confirm(&payment_id))
            .await
            .unwrap_err();
    assert!(matches!(err, AppError::Unauthorized(_)));
    assert_eq!(reload_product(&state, product.id).await?.stock, 5);

    assert!(order_service::get_order(&state, &admin, created.order.id).await.is_ok());
    let err = order_service::confirm_delivery(&state, &owner, created.order.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden));
    Ok(())
}

#[tokio::test]
async fn concurrent_confirmations_never_oversell() -> anyhow::Result<()> {
    let Some((state, gateway)) = setup().await? else {
        return Ok(());
    };
    let buyer = create_user(&state, Role::User).await?;
    let product = create_product(&state, 1000, 5).await?;

    let mut orders = Vec::new();
    for _ in 0..2 {
        let created =
            order_service::create_order(&state, &buyer, order_request(&[(product.id, 3)]))
                .await?
                .data
                .expect("created order");
        let payment_id = created.order.payment_id.clone().expect("payment id");
        gateway.set_status(&payment_id, "succeeded");
        orders.push((created.order.id, payment_id));
    }

    let (first, second) = tokio::join!(
        order_service::confirm_payment(&state, &buyer, orders[0].0, confirm(&orders[0].1)),
        order_service::confirm_payment(&state, &buyer, orders[1].0, confirm(&orders[1].1)),
    );
    let results = [first, second];
    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(succeeded, 1);
    let failure = results.iter().find_map(|r| r.as_ref().err()).expect("one failure");
    assert!(matches!(failure, AppError::InsufficientStock { .. }));

    let after = reload_product(&state, product.id).await?;
    assert_eq!(after.stock, 2);
    assert_eq!(after.total_sales, 3);
    Ok(())
}

#[tokio::test]
async fn failed_decrement_leaves_every_product_untouched() -> anyhow::Result<()> {
    let Some((state, gateway)) = setup().await? else {
        return Ok(());
    };
    let buyer = create_user(&state, Role::User).await?;
    let plenty = create_product(&state, 1000, 10).await?;
    let scarce = create_product(&state, 2500, 5).await?;

    let created = order_service::create_order(
        &state,
        &buyer,
        order_request(&[(plenty.id, 2), (scarce.id, 3)]),
    )
    .await?
    .data
    .expect("created order");
    let payment_id = created.order.payment_id.clone().expect("payment id");
    gateway.set_status(&payment_id, "succeeded");

    // Another sale drains the scarce product before this one settles.
    Products::update_many()
        .col_expr(ProductCol::Stock, Expr::value(1))
        .filter(ProductCol::Id.eq(scarce.id))
        .exec(&state.orm)
        .await?;

    let err = order_service::confirm_payment(&state, &buyer, created.order.id, confirm(&payment_id))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::InsufficientStock { available: 1, requested: 3, .. }
    ));

    assert_eq!(reload_product(&state, plenty.id).await?.stock, 10);
    assert_eq!(reload_product(&state, scarce.id).await?.stock, 1);
    assert_eq!(reload_product(&state, plenty.id).await?.total_sales, 0);

    let order = order_service::get_order(&state, &buyer, created.order.id)
        .await?
        .data
        .expect("order");
    assert_eq!(order.order.payment_status, PaymentStatus::Pending);
    assert_eq!(order.order.status, OrderStatus::Pending);
    assert!(!order.order.is_paid);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sales_recomputes_converge() -> anyhow::Result<()> {
    const ORDERS: usize = 12;
    let Some((state, gateway)) = setup().await? else {
        return Ok(());
    };
    let buyer = create_user(&state, Role::User).await?;
    let product = create_product(&state, 1000, 100).await?;

    let mut pending = Vec::with_capacity(ORDERS);
    for _ in 0..ORDERS {
        let created =
            order_service::create_order(&state, &buyer, order_request(&[(product.id, 1)]))
                .await?
                .data
                .expect("created order");
        let payment_id = created.order.payment_id.clone().expect("payment id");
        gateway.set_status(&payment_id, "succeeded");
        pending.push((created.order.id, payment_id));
    }

    let mut confirmations = JoinSet::new();
    for (order_id, payment_id) in pending {
        let state = state.clone();
        let buyer = buyer.clone();
        confirmations.spawn(async move {
            order_service::confirm_payment(&state, &buyer, order_id, confirm(&payment_id))
                .await
                .map(|_| ())
        });
    }
    while let Some(joined) = confirmations.join_next().await {
        joined??;
    }

    let after = reload_product(&state, product.id).await?;
    assert_eq!(after.stock, 100 - ORDERS as i32);
    assert_eq!(after.total_sales, ORDERS as i64);
    Ok(())
}
