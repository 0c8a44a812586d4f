use chrono::Utc;
use sea_orm::ActiveValue::NotSet;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use uuid::Uuid;

use crate::{
    dto::reviews::{CreateReviewRequest, ReviewList, UpdateReviewRequest},
    entity::reviews::{ActiveModel, Column, Entity as Reviews, Model as ReviewModel},
    error::{AppError, AppResult},
    middleware::auth::{AuthUser, ensure_owner_or_admin},
    models::Review,
    response::{ApiResponse, Meta},
    services::{account_service, aggregate_service::AffectedProducts, catalog_service},
    state::AppState,
};

const MAX_COMMENT_LEN: usize = 1000;

pub async fn list_reviews(
    state: &AppState,
    product_id: Uuid,
) -> AppResult<ApiResponse<ReviewList>> {
    catalog_service::find_live(&state.orm, product_id).await?;
    let items: Vec<Review> = Reviews::find()
        .filter(Column::ProductId.eq(product_id))
        .filter(Column::DeletedAt.is_null())
        .order_by_desc(Column::CreatedAt)
        .all(&state.orm)
        .await?
        .into_iter()
        .map(Review::from)
        .collect();
    let meta = Meta::single_page(items.len());
    Ok(ApiResponse::success("Reviews", ReviewList { items }, Some(meta)))
}

pub async fn create_review(
    state: &AppState,
    user: &AuthUser,
    product_id: Uuid,
    payload: CreateReviewRequest,
) -> AppResult<ApiResponse<Review>> {
    validate_rating(payload.rating)?;
    let comment = normalize_comment(payload.comment)?;

    let txn = state.orm.begin().await?;
    account_service::find_live_user(&txn, user.user_id).await?;
    catalog_service::find_live(&txn, product_id).await?;

    let review = ActiveModel {
        id: Set(Uuid::new_v4()),
        user_id: Set(user.user_id),
        product_id: Set(product_id),
        rating: Set(payload.rating),
        comment: Set(comment),
        created_at: NotSet,
        updated_at: NotSet,
        deleted_at: Set(None),
    }
    .insert(&txn)
    .await?;

    let affected = AffectedProducts::ratings([product_id]);
    state.aggregates.within(&txn, &affected).await?;
    txn.commit().await?;
    state.aggregates.after_commit(&state.orm, &affected).await;

    tracing::debug!(review_id = %review.id, %product_id, rating = review.rating, "review created");
    Ok(ApiResponse::success(
        "Review created",
        Review::from(review),
        Some(Meta::empty()),
    ))
}

pub async fn update_review(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    payload: UpdateReviewRequest,
) -> AppResult<ApiResponse<Review>> {
    if let Some(rating) = payload.rating {
        validate_rating(rating)?;
    }
    let comment = normalize_comment(payload.comment)?;

    let txn = state.orm.begin().await?;
    let existing = find_live_review(&txn, id).await?;
    ensure_owner_or_admin(user, existing.user_id, "review")?;
    let product_id = existing.product_id;

    let mut active: ActiveModel = existing.into();
    if let Some(rating) = payload.rating {
        active.rating = Set(rating);
    }
    if comment.is_some() {
        active.comment = Set(comment);
    }
    active.updated_at = Set(Utc::now().into());
    let review = active.update(&txn).await?;

    let affected = AffectedProducts::ratings([product_id]);
    state.aggregates.within(&txn, &affected).await?;
    txn.commit().await?;
    state.aggregates.after_commit(&state.orm, &affected).await;

    Ok(ApiResponse::success(
        "Updated",
        Review::from(review),
        Some(Meta::empty()),
    ))
}

/// Soft delete; the product's rating is recomputed without the review.
pub async fn delete_review(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<serde_json::Value>> {
    let txn = state.orm.begin().await?;
    let existing = find_live_review(&txn, id).await?;
    ensure_owner_or_admin(user, existing.user_id, "review")?;
    let product_id = existing.product_id;

    let now = Utc::now();
    let mut active: ActiveModel = existing.into();
    active.deleted_at = Set(Some(now.into()));
    active.updated_at = Set(now.into());
    active.update(&txn).await?;

    let affected = AffectedProducts::ratings([product_id]);
    state.aggregates.within(&txn, &affected).await?;
    txn.commit().await?;
    state.aggregates.after_commit(&state.orm, &affected).await;

    Ok(ApiResponse::success(
        "Deleted",
        serde_json::json!({}),
        Some(Meta::empty()),
    ))
}

async fn find_live_review<C: ConnectionTrait>(conn: &C, id: Uuid) -> AppResult<ReviewModel> {
    Reviews::find_by_id(id)
        .filter(Column::DeletedAt.is_null())
        .one(conn)
        .await?
        .ok_or_else(|| AppError::not_found("Review"))
}

fn validate_rating(rating: i32) -> AppResult<()> {
    if !(1..=5).contains(&rating) {
        return Err(AppError::validation("Rating must be between 1 and 5"));
    }
    Ok(())
}

fn normalize_comment(comment: Option<String>) -> AppResult<Option<String>> {
    let Some(comment) = comment else {
        return Ok(None);
    };
    let comment = comment.trim().to_string();
    if comment.chars().count() > MAX_COMMENT_LEN {
        return Err(AppError::validation("Comment is too long"));
    }
    Ok(Some(comment).filter(|c| !c.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rating_must_be_one_to_five() {
        assert!(validate_rating(0).is_err());
        assert!(validate_rating(6).is_err());
        for rating in 1..=5 {
            assert!(validate_rating(rating).is_ok());
        }
    }

    #[test]
    fn blank_comment_is_dropped() {
        assert_eq!(normalize_comment(Some("   ".into())).unwrap(), None);
        assert_eq!(
            normalize_comment(Some(" fast delivery ".into())).unwrap(),
            Some("fast delivery".to_string())
        );
        assert!(normalize_comment(Some("x".repeat(1001))).is_err());
    }
}
