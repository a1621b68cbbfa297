use sqlx::{postgres::PgPoolOptions, PgPool};

pub struct Database {
    pub pool: PgPool,
}

impl Database {
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        // Fail fast if PostGIS is missing; area lookups depend on it.
        sqlx::query("SELECT postgis_version()")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }
}
