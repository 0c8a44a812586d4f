//! Derived product aggregates: `total_sales`, `average_rating`, `num_reviews`.
//!
//! Every value is recomputed from the current rows, never incremented in
//! place, so refunds, edits and soft deletes correct themselves on the next
//! run and two concurrent runs for the same product converge on the same
//! result.

use std::{collections::BTreeSet, str::FromStr, time::Duration};

use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter, QuerySelect,
    TransactionTrait,
    sea_query::{Expr, LockType},
};
use uuid::Uuid;

use crate::{
    entity::{
        enums::PaymentStatus,
        order_items::{Column as OrderItemCol, Entity as OrderItems},
        orders::{Column as OrderCol, Entity as Orders},
        products::{Column as ProdCol, Entity as Products},
        reviews::{Column as ReviewCol, Entity as Reviews},
    },
    error::{AppError, AppResult},
    middleware::auth::{AuthUser, ensure_admin},
    response::{ApiResponse, Meta},
    services::catalog_service::{self, AggregateUpdate},
    state::AppState,
};

/// Where recomputation runs relative to the write that triggered it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecomputePolicy {
    /// After commit, with retries. A final failure is logged and the
    /// aggregate stays stale until the next successful run.
    #[default]
    AfterCommit,
    /// Inside the triggering transaction. A failure rolls the business
    /// operation back.
    InTransaction,
}

impl FromStr for RecomputePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "after_commit" => Ok(RecomputePolicy::AfterCommit),
            "in_transaction" => Ok(RecomputePolicy::InTransaction),
            other => Err(anyhow::anyhow!(
                "unknown aggregate recompute policy `{other}` (expected after_commit or in_transaction)"
            )),
        }
    }
}

/// "Product affected" notification emitted by writers of orders and reviews.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AffectedProducts {
    pub sales: BTreeSet<Uuid>,
    pub ratings: BTreeSet<Uuid>,
}

impl AffectedProducts {
    pub fn sales(ids: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            sales: ids.into_iter().collect(),
            ratings: BTreeSet::new(),
        }
    }

    pub fn ratings(ids: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            sales: BTreeSet::new(),
            ratings: ids.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sales.is_empty() && self.ratings.is_empty()
    }

    fn products(&self) -> BTreeSet<Uuid> {
        self.sales.union(&self.ratings).copied().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RatingSummary {
    pub average_rating: Option<f64>,
    pub num_reviews: i32,
}

/// Mean rating rounded to one decimal. No reviews means no rating, not zero.
pub fn rating_summary(sum: i64, count: i64) -> RatingSummary {
    if count <= 0 {
        return RatingSummary {
            average_rating: None,
            num_reviews: 0,
        };
    }
    let mean = sum as f64 / count as f64;
    RatingSummary {
        average_rating: Some((mean * 10.0).round() / 10.0),
        num_reviews: i32::try_from(count).unwrap_or(i32::MAX),
    }
}

/// Units sold: line quantities on paid, non-deleted orders.
pub async fn sales_for_product<C: ConnectionTrait>(conn: &C, product_id: Uuid) -> AppResult<i64> {
    let total = OrderItems::find()
        .select_only()
        .column_as(
            Expr::col((OrderItems, OrderItemCol::Quantity)).sum(),
            "total_sales",
        )
        .inner_join(Orders)
        .filter(OrderItemCol::ProductId.eq(product_id))
        .filter(OrderCol::PaymentStatus.eq(PaymentStatus::Paid))
        .filter(OrderCol::DeletedAt.is_null())
        .into_tuple::<Option<i64>>()
        .one(conn)
        .await?
        .flatten();
    Ok(total.unwrap_or(0))
}

pub async fn rating_for_product<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
) -> AppResult<RatingSummary> {
    let (sum, count) = Reviews::find()
        .select_only()
        .column_as(Expr::col((Reviews, ReviewCol::Rating)).sum(), "rating_sum")
        .column_as(Expr::col((Reviews, ReviewCol::Id)).count(), "rating_count")
        .filter(ReviewCol::ProductId.eq(product_id))
        .filter(ReviewCol::DeletedAt.is_null())
        .into_tuple::<(Option<i64>, i64)>()
        .one(conn)
        .await?
        .unwrap_or((None, 0));
    Ok(rating_summary(sum.unwrap_or(0), count))
}

/// Recompute the requested aggregates of one product in one transaction
/// (a savepoint when `conn` is already a transaction).
///
/// The product row is locked before the source rows are read, so runs for
/// the same product are serialized and the last writer always saw every
/// change committed before it started.
pub async fn recompute_product<C: TransactionTrait>(
    conn: &C,
    product_id: Uuid,
    sales: bool,
    ratings: bool,
) -> AppResult<()> {
    let txn = conn.begin().await?;
    Products::find_by_id(product_id)
        .select_only()
        .column(ProdCol::Id)
        .lock(LockType::Update)
        .into_tuple::<Uuid>()
        .one(&txn)
        .await?
        .ok_or_else(|| AppError::not_found("Product"))?;

    let mut update = AggregateUpdate::default();
    if sales {
        update.total_sales = Some(sales_for_product(&txn, product_id).await?);
    }
    if ratings {
        update.rating = Some(rating_for_product(&txn, product_id).await?);
    }
    catalog_service::update_aggregates(&txn, product_id, &update).await?;

    txn.commit().await?;
    tracing::debug!(
        %product_id,
        total_sales = ?update.total_sales,
        rating = ?update.rating,
        "aggregates recomputed"
    );
    Ok(())
}

/// Rebuild aggregates for every product. Returns how many were touched.
pub async fn recompute_all(conn: &DatabaseConnection) -> AppResult<usize> {
    let ids: Vec<Uuid> = Products::find()
        .select_only()
        .column(ProdCol::Id)
        .into_tuple()
        .all(conn)
        .await?;
    for id in &ids {
        recompute_product(conn, *id, true, true).await?;
    }
    tracing::info!(products = ids.len(), "aggregates rebuilt");
    Ok(ids.len())
}

/// Admin maintenance entry point for [`recompute_all`].
pub async fn rebuild_aggregates(
    state: &AppState,
    user: &AuthUser,
) -> AppResult<ApiResponse<serde_json::Value>> {
    ensure_admin(user)?;
    let products = recompute_all(&state.orm).await?;
    Ok(ApiResponse::success(
        "Aggregates rebuilt",
        serde_json::json!({ "products": products }),
        Some(Meta::empty()),
    ))
}

/// Subscriber for [`AffectedProducts`] notifications.
#[derive(Debug, Clone)]
pub struct AggregateRecalculator {
    policy: RecomputePolicy,
    retries: u32,
}

impl Default for AggregateRecalculator {
    fn default() -> Self {
        Self::new(RecomputePolicy::default(), 3)
    }
}

impl AggregateRecalculator {
    pub fn new(policy: RecomputePolicy, retries: u32) -> Self {
        Self { policy, retries }
    }

    /// Call with the open transaction, right before commit. Only does work
    /// under [`RecomputePolicy::InTransaction`].
    pub async fn within<C: TransactionTrait>(
        &self,
        txn: &C,
        affected: &AffectedProducts,
    ) -> AppResult<()> {
        if self.policy != RecomputePolicy::InTransaction || affected.is_empty() {
            return Ok(());
        }
        for product_id in affected.products() {
            recompute_product(
                txn,
                product_id,
                affected.sales.contains(&product_id),
                affected.ratings.contains(&product_id),
            )
            .await?;
        }
        Ok(())
    }

    /// Call once the triggering transaction has committed. Only does work
    /// under [`RecomputePolicy::AfterCommit`]; never fails the caller.
    pub async fn after_commit(&self, conn: &DatabaseConnection, affected: &AffectedProducts) {
        if self.policy != RecomputePolicy::AfterCommit || affected.is_empty() {
            return;
        }
        for product_id in affected.products() {
            let sales = affected.sales.contains(&product_id);
            let ratings = affected.ratings.contains(&product_id);
            if let Err(err) = self.recompute_with_retry(conn, product_id, sales, ratings).await {
                tracing::warn!(%product_id, error = %err, "aggregate recompute failed, value left stale");
            }
        }
    }

    async fn recompute_with_retry(
        &self,
        conn: &DatabaseConnection,
        product_id: Uuid,
        sales: bool,
        ratings: bool,
    ) -> AppResult<()> {
        let mut attempt = 0;
        loop {
            match recompute_product(conn, product_id, sales, ratings).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < self.retries && is_retryable(&err) => {
                    attempt += 1;
                    tracing::debug!(%product_id, attempt, error = %err, "retrying aggregate recompute");
                    tokio::time::sleep(Duration::from_millis(25 * u64::from(attempt))).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn is_retryable(err: &AppError) -> bool {
    matches!(err, AppError::OrmError(_) | AppError::DbError(_))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_is_rounded_to_one_decimal() {
        let summary = rating_summary(5 + 3 + 4, 3);
        assert_eq!(summary.average_rating, Some(4.0));
        assert_eq!(summary.num_reviews, 3);

        assert_eq!(rating_summary(5 + 4 + 4, 3).average_rating, Some(4.3));
        assert_eq!(rating_summary(5 + 4, 2).average_rating, Some(4.5));
        assert_eq!(rating_summary(1, 1).average_rating, Some(1.0));
    }

    #[test]
    fn no_reviews_leaves_rating_unset() {
        let summary = rating_summary(0, 0);
        assert_eq!(summary.average_rating, None);
        assert_eq!(summary.num_reviews, 0);
    }

    #[test]
    fn policy_parses_from_config() {
        assert_eq!(
            "after_commit".parse::<RecomputePolicy>().unwrap(),
            RecomputePolicy::AfterCommit
        );
        assert_eq!(
            "in_transaction".parse::<RecomputePolicy>().unwrap(),
            RecomputePolicy::InTransaction
        );
        assert!("eventually".parse::<RecomputePolicy>().is_err());
    }

    #[test]
    fn affected_products_merges_both_sets() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut affected = AffectedProducts::sales([a]);
        affected.ratings.insert(b);
        affected.ratings.insert(a);
        assert_eq!(affected.products().len(), 2);
        assert!(!affected.is_empty());
        assert!(AffectedProducts::default().is_empty());
    }
}
