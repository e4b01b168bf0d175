use sqlx::Row;

fn database_url() -> String {
    dotenvy::dotenv().ok();

    if let Ok(url) = std::env::var("DATABASE_URL") {
        if !url.trim().is_empty() {
            return url;
        }
    }

    let server = std::env::var("POSTGRES_SERVER").unwrap_or_else(|_| "localhost".into());
    let port = std::env::var("POSTGRES_PORT").unwrap_or_else(|_| "5432".into());
    let user = std::env::var("POSTGRES_USER").unwrap_or_else(|_| "markwise".into());
    let password = std::env::var("POSTGRES_PASSWORD").unwrap_or_default();
    let db = std::env::var("POSTGRES_DB").unwrap_or_else(|_| "markwise".into());

    format!("postgresql://{user}:{password}@{server}:{port}/{db}")
}

async fn migrated_pool() -> anyhow::Result<sqlx::PgPool> {
    let pool =
        sqlx::postgres::PgPoolOptions::new().max_connections(1).connect(&database_url()).await?;

    let migrations_dir =
        std::env::var("MARKWISE_MIGRATIONS_DIR").unwrap_or_else(|_| "migrations".to_string());
    let migrator = sqlx::migrate::Migrator::new(std::path::Path::new(&migrations_dir)).await?;
    migrator.run(&pool).await?;

    Ok(pool)
}

#[tokio::test]
#[ignore = "needs a running Postgres"]
async fn migrations_apply_and_tables_exist() -> anyhow::Result<()> {
    let pool = migrated_pool().await?;

    for table in ["model_answers", "submission_batches", "submissions"] {
        let row = sqlx::query("SELECT to_regclass($1)::text").bind(table).fetch_one(&pool).await?;
        let regclass: Option<String> = row.try_get(0)?;
        assert!(regclass.is_some(), "expected table {table} to exist after migrations");
    }

    Ok(())
}

#[tokio::test]
#[ignore = "needs a running Postgres"]
async fn completed_submission_requires_a_score() -> anyhow::Result<()> {
    let pool = migrated_pool().await?;
    let suffix = uuid::Uuid::new_v4().to_string();
    let answer_id = format!("ma-{suffix}");
    let batch_id = format!("batch-{suffix}");

    sqlx::query(
        "INSERT INTO model_answers (id, owner_id, document_ref, extracted_text, total_marks, \
         created_at, updated_at) VALUES ($1, 'owner', 'model.pdf', 'text', 10, now(), now())",
    )
    .bind(&answer_id)
    .execute(&pool)
    .await?;
    sqlx::query(
        "INSERT INTO submission_batches (id, model_answer_id, created_at) VALUES ($1, $2, now())",
    )
    .bind(&batch_id)
    .bind(&answer_id)
    .execute(&pool)
    .await?;

    let rejected = sqlx::query(
        "INSERT INTO submissions (id, batch_id, position, document_ref, status, created_at, \
         updated_at) VALUES ($1, $2, 0, 'a.pdf', 'completed', now(), now())",
    )
    .bind(format!("sub-{suffix}"))
    .bind(&batch_id)
    .execute(&pool)
    .await;
    assert!(rejected.is_err(), "completed row without a score must violate a check constraint");

    let referenced = sqlx::query("DELETE FROM model_answers WHERE id = $1")
        .bind(&answer_id)
        .execute(&pool)
        .await;
    assert!(referenced.is_err(), "model answer with batches must not be deletable directly");

    sqlx::query("DELETE FROM submission_batches WHERE id = $1").bind(&batch_id).execute(&pool).await?;
    sqlx::query("DELETE FROM model_answers WHERE id = $1").bind(&answer_id).execute(&pool).await?;

    Ok(())
}
