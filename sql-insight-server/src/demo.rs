//! Demo database: a small shop with customers, orders and monthly revenue

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use tracing::info;

/// Create (if needed) and seed the demo database, returning its connection string
pub async fn prepare(path: &Path) -> Result<String, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(SqliteConnectOptions::new().filename(path).create_if_missing(true))
        .await?;

    setup(&pool).await?;
    pool.close().await;

    Ok(format!("sqlite://{}", path.display()))
}

pub async fn setup(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS customers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            region TEXT NOT NULL,
            revenue REAL NOT NULL,
            signed_up DATE NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS orders (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            customer_id INTEGER NOT NULL REFERENCES customers(id),
            total REAL NOT NULL,
            status TEXT NOT NULL,
            ordered_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS monthly_revenue (
            month TEXT PRIMARY KEY,
            revenue REAL NOT NULL,
            orders INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    seed_sample_data(pool).await
}

async fn seed_sample_data(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let customer_count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM customers")
        .fetch_one(pool)
        .await?;

    if customer_count.0 > 0 {
        // Data already seeded
        return Ok(());
    }

    let names = [
        "Acme", "Globex", "Initech", "Umbrella", "Hooli", "Stark Industries", "Wayne Enterprises",
        "Wonka", "Cyberdyne", "Soylent", "Tyrell", "Vandelay", "Pied Piper", "Dunder Mifflin",
        "Gringotts", "Oscorp", "Monarch", "Aperture", "Black Mesa", "Massive Dynamic",
    ];
    let regions = ["north", "south", "east", "west"];

    for (index, name) in names.iter().enumerate() {
        let revenue = 2500.0 + ((index * 7919) % 40_000) as f64 + (index % 3) as f64 * 0.25;
        sqlx::query("INSERT INTO customers (name, region, revenue, signed_up) VALUES (?, ?, ?, ?)")
            .bind(*name)
            .bind(regions[index % regions.len()])
            .bind(revenue)
            .bind(format!("2023-{:02}-{:02}", index % 12 + 1, index % 28 + 1))
            .execute(pool)
            .await?;
    }

    let statuses = ["pending", "shipped", "completed", "cancelled"];
    for index in 0..400 {
        let customer_id = (index % names.len()) + 1;
        let total = 20.0 + ((index * 37) % 500) as f64;
        sqlx::query("INSERT INTO orders (customer_id, total, status, ordered_at) VALUES (?, ?, ?, ?)")
            .bind(customer_id as i64)
            .bind(total)
            .bind(statuses[index % statuses.len()])
            .bind(format!("2024-{:02}-{:02} 10:00:00", index % 12 + 1, index % 28 + 1))
            .execute(pool)
            .await?;
    }

    for month in 1..=12 {
        let revenue = 10_000.0 + month as f64 * 850.0 + if month % 4 == 0 { -400.0 } else { 0.0 };
        sqlx::query("INSERT INTO monthly_revenue (month, revenue, orders) VALUES (?, ?, ?)")
            .bind(format!("2024-{:02}", month))
            .bind(revenue)
            .bind(200 + month * 9)
            .execute(pool)
            .await?;
    }

    info!(
        customers = names.len(),
        orders = 400,
        months = 12,
        "demo data seeded"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prepare_is_idempotent() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("demo.db");

        let uri = prepare(&path).await.unwrap();
        assert!(uri.starts_with("sqlite://"));
        prepare(&path).await.unwrap();

        let pool = SqlitePool::connect_with(SqliteConnectOptions::new().filename(&path))
            .await
            .unwrap();
        let customers: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM customers")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(customers.0, 20);
        let months: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM monthly_revenue")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(months.0, 12);
    }
}
