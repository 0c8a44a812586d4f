use std::collections::HashSet;

use argon2::{
    Argon2, PasswordHasher,
    password_hash::{PasswordHash, PasswordVerifier, SaltString},
};
use chrono::{Duration, Utc};
use jsonwebtoken::{EncodingKey, Header, encode};
use password_hash::rand_core::{OsRng, RngCore};
use sea_orm::ActiveValue::NotSet;
use sea_orm::sea_query::{Expr, LockType};
use sea_orm::{
    ActiveEnum, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseTransaction, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{
    audit,
    dto::auth::{
        Claims, ForgotPasswordRequest, IssuedToken, LoginRequest, LoginResponse, RegisterRequest,
        ResetPasswordRequest, VerifyEmailRequest,
    },
    dto::users::{AdjustPointsRequest, ChangePasswordRequest, UpdateProfileRequest, UserList},
    entity::{
        enums::Role,
        orders::{Column as OrderCol, Entity as Orders},
        users::{ActiveModel as UserActive, Column as UserCol, Entity as Users, Model as UserModel},
    },
    error::{AppError, AppResult},
    middleware::auth::{AuthUser, ensure_admin, ensure_owner_or_admin},
    models::User,
    response::{ApiResponse, Meta},
    state::AppState,
};

const REFERRAL_CODE_LEN: usize = 6;
const REFERRAL_CODE_ATTEMPTS: usize = 5;
const REFERRAL_CHAIN_MAX_DEPTH: usize = 16;
const RESET_TOKEN_TTL_MINUTES: i64 = 10;
const VERIFICATION_TOKEN_TTL_HOURS: i64 = 24;

pub async fn register_user(
    state: &AppState,
    payload: RegisterRequest,
) -> AppResult<ApiResponse<User>> {
    let RegisterRequest {
        name,
        email,
        password,
        referral_code,
    } = payload;
    let name = name.trim().to_string();
    let email = normalize_email(&email);
    validate_name(&name)?;
    validate_email(&email)?;
    validate_password(&password)?;

    let exist = Users::find()
        .filter(UserCol::Email.eq(email.as_str()))
        .one(&state.orm)
        .await?;
    if exist.is_some() {
        return Err(AppError::validation("Email is already taken"));
    }

    let referred_by_id = match referral_code.as_deref().map(str::trim) {
        Some(code) if !code.is_empty() => {
            let referrer = Users::find()
                .filter(UserCol::ReferralCode.eq(code.to_uppercase()))
                .filter(UserCol::DeletedAt.is_null())
                .one(&state.orm)
                .await?
                .ok_or_else(|| AppError::validation("Unknown referral code"))?;
            Some(referrer.id)
        }
        _ => None,
    };

    let password_hash = hash_password(&password)?;
    let referral_code = unused_referral_code(&state.orm).await?;

    let user = UserActive {
        id: Set(Uuid::new_v4()),
        name: Set(name),
        email: Set(email),
        password_hash: Set(password_hash),
        role: Set(Role::User),
        referral_code: Set(referral_code),
        referred_by_id: Set(referred_by_id),
        points: Set(0),
        reset_password_token: Set(None),
        reset_password_expire: Set(None),
        email_verification_token: Set(None),
        email_verification_expire: Set(None),
        is_email_verified: Set(false),
        created_at: NotSet,
        updated_at: NotSet,
        deleted_at: Set(None),
    }
    .insert(&state.orm)
    .await?;

    tracing::info!(user_id = %user.id, referred = referred_by_id.is_some(), "user registered");
    audit::record(
        state,
        Some(user.id),
        "user_register",
        "users",
        serde_json::json!({ "user_id": user.id }),
    )
    .await;
    Ok(ApiResponse::success("User created", User::from(user), None))
}

pub async fn login_user(
    state: &AppState,
    payload: LoginRequest,
) -> AppResult<ApiResponse<LoginResponse>> {
    let LoginRequest { email, password } = payload;
    let user = Users::find()
        .filter(UserCol::Email.eq(normalize_email(&email)))
        .filter(UserCol::DeletedAt.is_null())
        .one(&state.orm)
        .await?;

    let user = match user {
        Some(u) => u,
        None => return Err(AppError::Unauthorized("Invalid email or password".into())),
    };

    if !verify_password(&password, &user.password_hash)? {
        return Err(AppError::Unauthorized("Invalid email or password".into()));
    }

    let expiration = Utc::now()
        .checked_add_signed(Duration::hours(state.auth.jwt_ttl_hours))
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("Failed to set expiration")))?;

    let claims = Claims {
        sub: user.id.to_string(),
        role: user.role.to_value(),
        exp: expiration.timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(state.auth.jwt_secret.as_bytes()),
    )
    .map_err(|e| AppError::Internal(anyhow::anyhow!(e.to_string())))?;

    tracing::debug!(user_id = %user.id, "user logged in");
    Ok(ApiResponse::success(
        "Logged in",
        LoginResponse {
            token: format!("Bearer {}", token),
        },
        Some(Meta::empty()),
    ))
}

/// Every order's owner resolves through here before an order is written.
pub async fn find_live_user<C: ConnectionTrait>(conn: &C, id: Uuid) -> AppResult<UserModel> {
    Users::find_by_id(id)
        .filter(UserCol::DeletedAt.is_null())
        .one(conn)
        .await?
        .ok_or_else(|| AppError::not_found("User"))
}

/// Locked read of a live user. `Share` for writers that hang rows off the
/// user, `Update` for writers of the user row itself.
pub async fn lock_live_user(
    txn: &DatabaseTransaction,
    id: Uuid,
    lock: LockType,
) -> AppResult<UserModel> {
    Users::find_by_id(id)
        .filter(UserCol::DeletedAt.is_null())
        .lock(lock)
        .one(txn)
        .await?
        .ok_or_else(|| AppError::not_found("User"))
}

pub async fn get_user(state: &AppState, user: &AuthUser, id: Uuid) -> AppResult<ApiResponse<User>> {
    ensure_owner_or_admin(user, id, "user")?;
    let found = find_live_user(&state.orm, id).await?;
    Ok(ApiResponse::success("User", User::from(found), Some(Meta::empty())))
}

pub async fn update_profile(
    state: &AppState,
    user: &AuthUser,
    payload: UpdateProfileRequest,
) -> AppResult<ApiResponse<User>> {
    let existing = find_live_user(&state.orm, user.user_id).await?;
    let mut active: UserActive = existing.clone().into();

    if let Some(name) = payload.name {
        let name = name.trim().to_string();
        validate_name(&name)?;
        active.name = Set(name);
    }
    if let Some(email) = payload.email {
        let email = normalize_email(&email);
        validate_email(&email)?;
        if email != existing.email {
            let taken = Users::find()
                .filter(UserCol::Email.eq(email.as_str()))
                .count(&state.orm)
                .await?;
            if taken > 0 {
                return Err(AppError::validation("Email is already taken"));
            }
            active.is_email_verified = Set(false);
        }
        active.email = Set(email);
    }
    active.updated_at = Set(Utc::now().into());

    let updated = active.update(&state.orm).await?;
    Ok(ApiResponse::success("Updated", User::from(updated), Some(Meta::empty())))
}

/// The new password is re-hashed; the plain text is never stored.
pub async fn change_password(
    state: &AppState,
    user: &AuthUser,
    payload: ChangePasswordRequest,
) -> AppResult<ApiResponse<serde_json::Value>> {
    let existing = find_live_user(&state.orm, user.user_id).await?;
    if !verify_password(&payload.current_password, &existing.password_hash)? {
        return Err(AppError::Unauthorized("Current password is incorrect".into()));
    }
    validate_password(&payload.new_password)?;

    let mut active: UserActive = existing.into();
    active.password_hash = Set(hash_password(&payload.new_password)?);
    active.updated_at = Set(Utc::now().into());
    active.update(&state.orm).await?;

    Ok(ApiResponse::success(
        "Password updated",
        serde_json::json!({}),
        Some(Meta::empty()),
    ))
}

/// Users directly referred by the caller.
pub async fn list_referrals(state: &AppState, user: &AuthUser) -> AppResult<ApiResponse<UserList>> {
    let items: Vec<User> = Users::find()
        .filter(UserCol::ReferredById.eq(user.user_id))
        .filter(UserCol::DeletedAt.is_null())
        .order_by_desc(UserCol::CreatedAt)
        .all(&state.orm)
        .await?
        .into_iter()
        .map(User::from)
        .collect();
    let meta = Meta::single_page(items.len());
    Ok(ApiResponse::success("Referrals", UserList { items }, Some(meta)))
}

/// Walk `referred_by_id` upwards from `user_id`: nearest referrer first.
/// Stops at the root, at `max_depth`, or when a user repeats.
pub async fn referral_chain<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
    max_depth: usize,
) -> AppResult<Vec<UserModel>> {
    let start = find_live_user(conn, user_id).await?;
    let mut seen = HashSet::from([start.id]);
    let mut chain = Vec::new();
    let mut next = start.referred_by_id;

    while let Some(referrer_id) = next {
        if chain.len() >= max_depth || !seen.insert(referrer_id) {
            break;
        }
        let Some(referrer) = Users::find_by_id(referrer_id)
            .filter(UserCol::DeletedAt.is_null())
            .one(conn)
            .await?
        else {
            break;
        };
        next = referrer.referred_by_id;
        chain.push(referrer);
    }
    Ok(chain)
}

pub async fn get_referral_chain(
    state: &AppState,
    user: &AuthUser,
) -> AppResult<ApiResponse<UserList>> {
    let items: Vec<User> = referral_chain(&state.orm, user.user_id, REFERRAL_CHAIN_MAX_DEPTH)
        .await?
        .into_iter()
        .map(User::from)
        .collect();
    Ok(ApiResponse::success(
        "Referral chain",
        UserList { items },
        Some(Meta::empty()),
    ))
}

pub async fn adjust_points(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    payload: AdjustPointsRequest,
) -> AppResult<ApiResponse<User>> {
    ensure_admin(user)?;
    if payload.delta == 0 {
        return Err(AppError::validation("delta must not be 0"));
    }

    let txn = state.orm.begin().await?;
    let existing = lock_live_user(&txn, id, LockType::Update).await?;
    let points = next_balance(existing.points, payload.delta)?;

    let mut active: UserActive = existing.into();
    active.points = Set(points);
    active.updated_at = Set(Utc::now().into());
    let updated = active.update(&txn).await?;
    txn.commit().await?;

    audit::record(
        state,
        Some(user.user_id),
        "points_adjust",
        "users",
        serde_json::json!({ "user_id": id, "delta": payload.delta }),
    )
    .await;
    Ok(ApiResponse::success("Points updated", User::from(updated), Some(Meta::empty())))
}

/// Soft delete. Refused while the user owns orders, mirroring the RESTRICT
/// foreign key; users they referred lose the link.
pub async fn delete_user(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<serde_json::Value>> {
    ensure_admin(user)?;

    // Order creation share-locks the buyer, so no order can appear between
    // the count and the soft delete.
    let txn = state.orm.begin().await?;
    let existing = lock_live_user(&txn, id, LockType::Update).await?;
    let orders = Orders::find()
        .filter(OrderCol::UserId.eq(id))
        .count(&txn)
        .await?;
    if orders > 0 {
        return Err(AppError::InvalidState(format!(
            "User owns {orders} order(s) and cannot be deleted"
        )));
    }

    Users::update_many()
        .col_expr(UserCol::ReferredById, Expr::value(Option::<Uuid>::None))
        .filter(UserCol::ReferredById.eq(id))
        .exec(&txn)
        .await?;
    let now = Utc::now();
    let mut active: UserActive = existing.into();
    active.deleted_at = Set(Some(now.into()));
    active.updated_at = Set(now.into());
    active.update(&txn).await?;
    txn.commit().await?;

    audit::record(
        state,
        Some(user.user_id),
        "user_delete",
        "users",
        serde_json::json!({ "user_id": id }),
    )
    .await;
    Ok(ApiResponse::success("Deleted", serde_json::json!({}), Some(Meta::empty())))
}

/// Issue a password reset token. The plain token is returned for delivery
/// by the mailer; only its SHA-256 digest is stored.
pub async fn forgot_password(
    state: &AppState,
    payload: ForgotPasswordRequest,
) -> AppResult<ApiResponse<IssuedToken>> {
    let user = Users::find()
        .filter(UserCol::Email.eq(normalize_email(&payload.email)))
        .filter(UserCol::DeletedAt.is_null())
        .one(&state.orm)
        .await?
        .ok_or_else(|| AppError::not_found("User"))?;

    let (token, digest) = new_token();
    let expires_at = Utc::now() + Duration::minutes(RESET_TOKEN_TTL_MINUTES);
    let mut active: UserActive = user.into();
    active.reset_password_token = Set(Some(digest));
    active.reset_password_expire = Set(Some(expires_at.into()));
    active.update(&state.orm).await?;

    Ok(ApiResponse::success(
        "Reset token issued",
        IssuedToken { token, expires_at },
        Some(Meta::empty()),
    ))
}

pub async fn reset_password(
    state: &AppState,
    payload: ResetPasswordRequest,
) -> AppResult<ApiResponse<serde_json::Value>> {
    validate_password(&payload.password)?;
    let user = Users::find()
        .filter(UserCol::ResetPasswordToken.eq(hash_token(&payload.token)))
        .filter(UserCol::ResetPasswordExpire.gt(Utc::now()))
        .filter(UserCol::DeletedAt.is_null())
        .one(&state.orm)
        .await?
        .ok_or_else(|| AppError::validation("Invalid or expired token"))?;

    let mut active: UserActive = user.into();
    active.password_hash = Set(hash_password(&payload.password)?);
    active.reset_password_token = Set(None);
    active.reset_password_expire = Set(None);
    active.updated_at = Set(Utc::now().into());
    active.update(&state.orm).await?;

    Ok(ApiResponse::success(
        "Password reset",
        serde_json::json!({}),
        Some(Meta::empty()),
    ))
}

pub async fn issue_email_verification(
    state: &AppState,
    user: &AuthUser,
) -> AppResult<ApiResponse<IssuedToken>> {
    let existing = find_live_user(&state.orm, user.user_id).await?;
    if existing.is_email_verified {
        return Err(AppError::InvalidState("Email already verified".into()));
    }

    let (token, digest) = new_token();
    let expires_at = Utc::now() + Duration::hours(VERIFICATION_TOKEN_TTL_HOURS);
    let mut active: UserActive = existing.into();
    active.email_verification_token = Set(Some(digest));
    active.email_verification_expire = Set(Some(expires_at.into()));
    active.update(&state.orm).await?;

    Ok(ApiResponse::success(
        "Verification token issued",
        IssuedToken { token, expires_at },
        Some(Meta::empty()),
    ))
}

pub async fn verify_email(
    state: &AppState,
    payload: VerifyEmailRequest,
) -> AppResult<ApiResponse<User>> {
    let user = Users::find()
        .filter(UserCol::EmailVerificationToken.eq(hash_token(&payload.token)))
        .filter(UserCol::EmailVerificationExpire.gt(Utc::now()))
        .filter(UserCol::DeletedAt.is_null())
        .one(&state.orm)
        .await?
        .ok_or_else(|| AppError::validation("Invalid or expired token"))?;

    let mut active: UserActive = user.into();
    active.is_email_verified = Set(true);
    active.email_verification_token = Set(None);
    active.email_verification_expire = Set(None);
    active.updated_at = Set(Utc::now().into());
    let updated = active.update(&state.orm).await?;

    Ok(ApiResponse::success("Email verified", User::from(updated), Some(Meta::empty())))
}

pub fn hash_password(password: &str) -> AppResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| AppError::Internal(anyhow::anyhow!(e.to_string())))?
        .to_string();
    Ok(hash)
}

pub fn verify_password(password: &str, hash: &str) -> AppResult<bool> {
    let parsed_hash = PasswordHash::new(hash)
        .map_err(|_| AppError::Internal(anyhow::anyhow!("Invalid password hash")))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

/// Six upper-case base-36 characters.
pub fn generate_referral_code() -> String {
    const ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let mut bytes = [0u8; REFERRAL_CODE_LEN];
    OsRng.fill_bytes(&mut bytes);
    bytes
        .iter()
        .map(|b| ALPHABET[usize::from(*b) % ALPHABET.len()] as char)
        .collect()
}

async fn unused_referral_code<C: ConnectionTrait>(conn: &C) -> AppResult<String> {
    for _ in 0..REFERRAL_CODE_ATTEMPTS {
        let code = generate_referral_code();
        let taken = Users::find()
            .filter(UserCol::ReferralCode.eq(code.as_str()))
            .count(conn)
            .await?;
        if taken == 0 {
            return Ok(code);
        }
    }
    Err(AppError::Internal(anyhow::anyhow!(
        "could not find an unused referral code"
    )))
}

/// Returns `(plain, sha256_hex)`.
fn new_token() -> (String, String) {
    let mut bytes = [0u8; 20];
    OsRng.fill_bytes(&mut bytes);
    let token: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    let digest = hash_token(&token);
    (token, digest)
}

fn hash_token(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn validate_name(name: &str) -> AppResult<()> {
    let len = name.chars().count();
    if len == 0 || len > 50 {
        return Err(AppError::validation("Name must be 1 to 50 characters"));
    }
    Ok(())
}

fn validate_email(email: &str) -> AppResult<()> {
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.contains(char::is_whitespace)
        }
        None => false,
    };
    if !valid {
        return Err(AppError::validation("Please add a valid email"));
    }
    Ok(())
}

/// Balance after applying `delta`; never negative, never past `i32::MAX`.
fn next_balance(current: i32, delta: i32) -> AppResult<i32> {
    let next = current
        .checked_add(delta)
        .ok_or_else(|| AppError::validation("Points balance is out of range"))?;
    if next < 0 {
        return Err(AppError::validation("Points balance cannot go below zero"));
    }
    Ok(next)
}

fn validate_password(password: &str) -> AppResult<()> {
    if password.chars().count() < 6 {
        return Err(AppError::validation(
            "Password must be at least 6 characters long",
        ));
    }
    Ok(())
}
