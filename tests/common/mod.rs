#![allow(dead_code)]

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::Utc;
use giftcard_storefront::{
    db::{create_orm_conn, run_migrations},
    dto::{
        auth::RegisterRequest,
        orders::{CreateOrderRequest, LineRequest},
    },
    entity::{
        enums::{Category, PaymentMethod, Provider, Role},
        products::{ActiveModel as ProductActive, Entity as Products, Model as ProductModel},
        users::{Column as UserCol, Entity as Users},
    },
    error::{AppError, AppResult},
    middleware::auth::AuthUser,
    models::Address,
    payment::{PaymentGateway, PaymentIntent, PaymentIntentStatus},
    services::{account_service, aggregate_service::AggregateRecalculator},
    state::{AppState, AuthSettings},
};
use sea_orm::ActiveValue::NotSet;
use sea_orm::sea_query::Expr;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use uuid::Uuid;

/// In-memory processor. Intents start as `requires_payment_method`; tests
/// move them with [`ScriptedGateway::set_status`].
#[derive(Default)]
pub struct ScriptedGateway {
    intents: Mutex<HashMap<String, String>>,
    amounts: Mutex<HashMap<String, i64>>,
}

impl ScriptedGateway {
    pub fn set_status(&self, id: &str, status: &str) {
        self.intents
            .lock()
            .unwrap()
            .insert(id.to_string(), status.to_string());
    }

    pub fn amount_of(&self, id: &str) -> Option<i64> {
        self.amounts.lock().unwrap().get(id).copied()
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn create_payment_intent(
        &self,
        amount_minor: i64,
        _currency: &str,
        metadata: &BTreeMap<String, String>,
    ) -> AppResult<PaymentIntent> {
        assert_eq!(
            metadata.get("integration_check").map(String::as_str),
            Some("accept_a_payment")
        );
        let id = format!("pi_test_{}", Uuid::new_v4().simple());
        self.set_status(&id, "requires_payment_method");
        self.amounts.lock().unwrap().insert(id.clone(), amount_minor);
        Ok(PaymentIntent {
            client_secret: format!("{id}_secret"),
            id,
        })
    }

    async fn retrieve_payment_intent(&self, id: &str) -> AppResult<PaymentIntentStatus> {
        let status = self
            .intents
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::Upstream(format!("No such payment_intent: {id}")))?;
        Ok(PaymentIntentStatus {
            id: id.to_string(),
            status,
            created_at: Utc::now(),
            receipt_email: None,
        })
    }
}

/// Returns `None` (and the test should return early) when no database is configured.
pub async fn setup() -> anyhow::Result<Option<(AppState, Arc<ScriptedGateway>)>> {
    setup_with(AggregateRecalculator::default()).await
}

pub async fn setup_with(
    aggregates: AggregateRecalculator,
) -> anyhow::Result<Option<(AppState, Arc<ScriptedGateway>)>> {
    let database_url = match std::env::var("TEST_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
    {
        Ok(url) => url,
        Err(_) => {
            eprintln!("Skipping test: set TEST_DATABASE_URL or DATABASE_URL to run integration tests.");
            return Ok(None);
        }
    };

    let orm = create_orm_conn(&database_url).await?;
    run_migrations(&orm).await?;
    let gateway = Arc::new(ScriptedGateway::default());
    let state = AppState {
        orm,
        gateway: gateway.clone(),
        aggregates,
        auth: AuthSettings {
            jwt_secret: "test-secret".into(),
            jwt_ttl_hours: 1,
        },
        currency: "usd".into(),
    };
    Ok(Some((state, gateway)))
}

pub async fn create_user(state: &AppState, role: Role) -> anyhow::Result<AuthUser> {
    let email = format!("{}@example.com", Uuid::new_v4().simple());
    let user = account_service::register_user(
        state,
        RegisterRequest {
            name: "Test User".into(),
            email,
            password: "secret123".into(),
            referral_code: None,
        },
    )
    .await?
    .data
    .expect("registered user");

    if role == Role::Admin {
        Users::update_many()
            .col_expr(UserCol::Role, Expr::value(Role::Admin))
            .filter(UserCol::Id.eq(user.id))
            .exec(&state.orm)
            .await?;
    }
    Ok(AuthUser {
        user_id: user.id,
        role,
    })
}

pub async fn create_product(state: &AppState, price: i64, stock: i32) -> anyhow::Result<ProductModel> {
    let product = ProductActive {
        id: Set(Uuid::new_v4()),
        name: Set(format!("Steam Wallet {}", &Uuid::new_v4().simple().to_string()[..8])),
        description: Set("Steam wallet code".into()),
        category: Set(Category::Steam),
        price: Set(price),
        stock: Set(stock),
        image: Set("no-photo.jpg".into()),
        provider: Set(Provider::Manual),
        provider_product_id: Set(None),
        is_active: Set(true),
        average_rating: Set(None),
        num_reviews: Set(0),
        total_sales: Set(0),
        created_at: NotSet,
        updated_at: NotSet,
        deleted_at: Set(None),
    }
    .insert(&state.orm)
    .await?;
    Ok(product)
}

pub async fn reload_product(state: &AppState, id: Uuid) -> anyhow::Result<ProductModel> {
    Products::find_by_id(id)
        .one(&state.orm)
        .await?
        .ok_or_else(|| anyhow::anyhow!("product {id} vanished"))
}

pub fn order_request(lines: &[(Uuid, i32)]) -> CreateOrderRequest {
    CreateOrderRequest {
        order_items: lines
            .iter()
            .map(|(product_id, quantity)| LineRequest {
                product_id: *product_id,
                quantity: *quantity,
            })
            .collect(),
        shipping_address: Some(Address {
            address: "1 Ferris Way".into(),
            city: "Portland".into(),
            postal_code: "97201".into(),
            country: "US".into(),
        }),
        billing_address: None,
        payment_method: PaymentMethod::Stripe,
        provider: None,
    }
}
