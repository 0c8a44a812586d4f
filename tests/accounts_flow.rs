mod common;

use giftcard_storefront::{
    dto::{
        auth::{
            ForgotPasswordRequest, LoginRequest, RegisterRequest, ResetPasswordRequest,
            VerifyEmailRequest,
        },
        users::AdjustPointsRequest,
    },
    entity::{
        enums::Role,
        orders::{Column as OrderCol, Entity as Orders},
    },
    error::AppError,
    middleware::auth::AuthUser,
    models::User,
    services::{account_service, order_service},
    state::AppState,
};
use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter};
use uuid::Uuid;

use common::{create_product, create_user, order_request, setup};

fn unique_email() -> String {
    format!("{}@example.com", Uuid::new_v4().simple())
}

async fn register(
    state: &AppState,
    email: &str,
    referral_code: Option<String>,
) -> anyhow::Result<User> {
    let user = account_service::register_user(
        state,
        RegisterRequest {
            name: "Gamer".into(),
            email: email.to_string(),
            password: "secret123".into(),
            referral_code,
        },
    )
    .await?
    .data
    .expect("user");
    Ok(user)
}

fn as_user(user: &User) -> AuthUser {
    AuthUser {
        user_id: user.id,
        role: Role::User,
    }
}

#[tokio::test]
async fn registration_login_and_password_reset() -> anyhow::Result<()> {
    let Some((state, _gateway)) = setup().await? else {
        return Ok(());
    };
    let email = unique_email();
    let user = register(&state, &email, None).await?;
    assert_eq!(user.referral_code.len(), 6);
    assert_eq!(user.points, 0);

    let err = register(&state, &email, None).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<AppError>(),
        Some(AppError::Validation(_))
    ));

    let token = account_service::login_user(
        &state,
        LoginRequest {
            email: email.clone(),
            password: "secret123".into(),
        },
    )
    .await?
    .data
    .expect("token");
    assert!(token.token.starts_with("Bearer "));

    let err = account_service::login_user(
        &state,
        LoginRequest {
            email: email.clone(),
            password: "wrong-password".into(),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::Unauthorized(_)));

    let issued = account_service::forgot_password(
        &state,
        ForgotPasswordRequest {
            email: email.clone(),
        },
    )
    .await?
    .data
    .expect("reset token");
    account_service::reset_password(
        &state,
        ResetPasswordRequest {
            token: issued.token.clone(),
            password: "brand-new-pass".into(),
        },
    )
    .await?;

    // Tokens are single use.
    let err = account_service::reset_password(
        &state,
        ResetPasswordRequest {
            token: issued.token,
            password: "another-pass".into(),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    account_service::login_user(
        &state,
        LoginRequest {
            email,
            password: "brand-new-pass".into(),
        },
    )
    .await?;
    Ok(())
}

#[tokio::test]
async fn email_verification_round() -> anyhow::Result<()> {
    let Some((state, _gateway)) = setup().await? else {
        return Ok(());
    };
    let user = register(&state, &unique_email(), None).await?;
    let issued = account_service::issue_email_verification(&state, &as_user(&user))
        .await?
        .data
        .expect("verification token");

    let verified = account_service::verify_email(
        &state,
        VerifyEmailRequest {
            token: issued.token,
        },
    )
    .await?
    .data
    .expect("user");
    assert!(verified.is_email_verified);

    let err = account_service::issue_email_verification(&state, &as_user(&user))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));
    Ok(())
}

#[tokio::test]
async fn referrals_link_users_and_chain_upwards() -> anyhow::Result<()> {
    let Some((state, _gateway)) = setup().await? else {
        return Ok(());
    };
    let root = register(&state, &unique_email(), None).await?;
    let middle = register(&state, &unique_email(), Some(root.referral_code.clone())).await?;
    let leaf = register(
        &state,
        &unique_email(),
        Some(middle.referral_code.to_lowercase()),
    )
    .await?;
    assert_eq!(middle.referred_by_id, Some(root.id));
    assert_eq!(leaf.referred_by_id, Some(middle.id));

    let err = register(&state, &unique_email(), Some("NOPE00".into()))
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<AppError>(),
        Some(AppError::Validation(_))
    ));

    let chain = account_service::referral_chain(&state.orm, leaf.id, 16).await?;
    let ids: Vec<Uuid> = chain.iter().map(|u| u.id).collect();
    assert_eq!(ids, vec![middle.id, root.id]);
    assert_eq!(
        account_service::referral_chain(&state.orm, leaf.id, 1)
            .await?
            .len(),
        1
    );

    let referrals = account_service::list_referrals(&state, &as_user(&root))
        .await?
        .data
        .expect("referrals");
    assert_eq!(referrals.items.len(), 1);
    assert_eq!(referrals.items[0].id, middle.id);
    Ok(())
}

#[tokio::test]
async fn admin_points_and_deletion_rules() -> anyhow::Result<()> {
    let Some((state, _gateway)) = setup().await? else {
        return Ok(());
    };
    let admin = create_user(&state, Role::Admin).await?;
    let buyer = create_user(&state, Role::User).await?;

    let err = account_service::adjust_points(
        &state,
        &buyer,
        buyer.user_id,
        AdjustPointsRequest { delta: 100 },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::Forbidden));

    let updated = account_service::adjust_points(
        &state,
        &admin,
        buyer.user_id,
        AdjustPointsRequest { delta: 100 },
    )
    .await?
    .data
    .expect("user");
    assert_eq!(updated.points, 100);

    let err = account_service::adjust_points(
        &state,
        &admin,
        buyer.user_id,
        AdjustPointsRequest { delta: -101 },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let err = account_service::adjust_points(
        &state,
        &admin,
        buyer.user_id,
        AdjustPointsRequest { delta: i32::MAX },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
    let unchanged = account_service::get_user(&state, &admin, buyer.user_id)
        .await?
        .data
        .expect("user");
    assert_eq!(unchanged.points, 100);

    // A user who owns orders stays.
    let product = create_product(&state, 1000, 5).await?;
    order_service::create_order(&state, &buyer, order_request(&[(product.id, 1)])).await?;
    let err = account_service::delete_user(&state, &admin, buyer.user_id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));

    let idle = create_user(&state, Role::User).await?;
    account_service::delete_user(&state, &admin, idle.user_id).await?;
    let err = account_service::get_user(&state, &admin, idle.user_id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deletion_racing_a_new_order_keeps_the_rule() -> anyhow::Result<()> {
    let Some((state, _gateway)) = setup().await? else {
        return Ok(());
    };
    let admin = create_user(&state, Role::Admin).await?;
    let product = create_product(&state, 1000, 50).await?;

    for _ in 0..5 {
        let buyer = create_user(&state, Role::User).await?;
        let (created, deleted) = tokio::join!(
            order_service::create_order(&state, &buyer, order_request(&[(product.id, 1)])),
            account_service::delete_user(&state, &admin, buyer.user_id),
        );
        let orders = Orders::find()
            .filter(OrderCol::UserId.eq(buyer.user_id))
            .count(&state.orm)
            .await?;
        match deleted {
            Ok(_) => {
                assert!(matches!(created, Err(AppError::NotFound(_))));
                assert_eq!(orders, 0);
            }
            Err(err) => {
                assert!(matches!(err, AppError::InvalidState(_)));
                assert!(created.is_ok());
                assert_eq!(orders, 1);
            }
        }
    }
    Ok(())
}
