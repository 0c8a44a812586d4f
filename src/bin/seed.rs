use giftcard_storefront::{
    config,
    db::{create_orm_conn, run_migrations},
    services::{
        account_service::{generate_referral_code, hash_password},
        aggregate_service::recompute_all,
    },
};
use sqlx::PgPool;
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let orm = create_orm_conn(&config::database_url()?).await?;
    // Ensure migrations are applied.
    run_migrations(&orm).await?;
    let pool = orm.get_postgres_connection_pool();

    let admin_id = ensure_user(pool, "Admin", "admin@example.com", "admin123", "admin").await?;
    let user_id = ensure_user(pool, "Buyer", "user@example.com", "user123", "user").await?;
    seed_products(pool).await?;
    recompute_all(&orm).await?;

    println!("Seed completed. Admin ID: {admin_id}, User ID: {user_id}");
    Ok(())
}

async fn ensure_user(
    pool: &PgPool,
    name: &str,
    email: &str,
    password: &str,
    role: &str,
) -> anyhow::Result<Uuid> {
    let password_hash = hash_password(password)?;

    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        INSERT INTO users (id, name, email, password_hash, role, referral_code, is_email_verified)
        VALUES ($1, $2, $3, $4, $5, $6, TRUE)
        ON CONFLICT (email) DO UPDATE SET role = EXCLUDED.role
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(name)
    .bind(email)
    .bind(password_hash)
    .bind(role)
    .bind(generate_referral_code())
    .fetch_optional(pool)
    .await?;

    // If user already exists, fetch id
    let user_id = match row {
        Some((id,)) => id,
        None => {
            let existing: (Uuid,) = sqlx::query_as("SELECT id FROM users WHERE email = $1")
                .bind(email)
                .fetch_one(pool)
                .await?;
            existing.0
        }
    };

    println!("Ensured user {email} (role={role})");
    Ok(user_id)
}

async fn seed_products(pool: &PgPool) -> anyhow::Result<()> {
    // (name, description, category, price in cents, stock, provider)
    let products = vec![
        ("Steam Wallet 20 USD", "Steam wallet top-up code", "Steam", 2000_i64, 50, "SEAGM"),
        ("Roblox 800 Robux", "Robux gift card", "Roblox", 999, 100, "Kinguin"),
        ("Valorant 1000 VP", "Riot Points for Valorant", "Riot Games", 1000, 80, "SEAGM"),
        ("PlayStation Store 25 USD", "PSN wallet code", "PlayStation", 2500, 40, "Digiseller"),
        ("Xbox Game Pass 1 Month", "Game Pass Ultimate membership", "Xbox", 1699, 30, "Manual"),
        ("Nintendo eShop 10 USD", "eShop funds", "Nintendo", 1000, 60, "Kinguin"),
    ];

    for (name, desc, category, price, stock, provider) in products {
        sqlx::query(
            r#"
            INSERT INTO products (id, name, description, category, price, stock, provider)
            SELECT $1, $2, $3, $4, $5, $6, $7
            WHERE NOT EXISTS (SELECT 1 FROM products WHERE name = $2)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(desc)
        .bind(category)
        .bind(price)
        .bind(stock)
        .bind(provider)
        .execute(pool)
        .await?;
    }

    println!("Seeded products");
    Ok(())
}
