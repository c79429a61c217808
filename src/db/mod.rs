//! Database Module
//!
//! # Interview Q&A
//!
//! Q: 왜 PostgreSQL을 선택했는가?
//! A: 레몬 경제에 필요한 것
//!
//!    1. ACID 트랜잭션: 잔액과 원장이 항상 함께 변경
//!    2. row lock (`SELECT ... FOR UPDATE`): 사용자 잔액, 레몬 위치 점유
//!    3. 부분 unique index: 삭제되지 않은 row 사이에서만 이름/이메일 유일
//!    4. `generate_series`: 포트 풀을 메모리 free list 없이 한 문장으로 할당
//!
//! Q: 마이그레이션은 어떻게 적용하는가?
//! A: SQL 파일을 바이너리에 포함 (`include_str!`)
//!    - 시작 시 버전 순서대로, 파일 하나당 트랜잭션 하나
//!    - 적용된 버전은 `schema_migrations` 에 기록 → 재시작해도 재적용 안 함
//!
//! Q: 커넥션 풀은 어떻게 관리하는가?
//! A: SQLx의 PgPool 사용
//!    - 최대 커넥션 수는 POSTGRES_MAX_OPEN_CONNS, idle 시 최소 1개 유지
//!    - 커넥션 수명 제한 (0 = 무제한)
//!    - 획득 타임아웃 3초

mod instance;
mod ledger;
mod lemon;
pub mod models;
mod quiz;
pub mod repository;
mod user;

pub use models::*;
pub use repository::*;

use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, Executor, PgPool};

use crate::config::PostgresConfig;

/// 바이너리에 포함된 마이그레이션 (version, name, sql)
const MIGRATIONS: &[(i64, &str, &str)] = &[
    (1, "init", include_str!("../../migrations/0001_init.sql")),
    (2, "db_instances", include_str!("../../migrations/0002_db_instances.sql")),
    (3, "seed", include_str!("../../migrations/0003_seed.sql")),
];

/// 데이터베이스 연결 및 쿼리 담당
///
/// 모든 저장소 trait 의 PostgreSQL 구현체
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// 데이터베이스 연결
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        let mut options = PgPoolOptions::new()
            .max_connections(config.max_open_conns.max(1))
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(3));

        if config.conn_max_lifetime_minutes > 0 {
            options = options.max_lifetime(Duration::from_secs(config.conn_max_lifetime_minutes * 60));
        }

        let pool = options
            .connect(&config.url())
            .await
            .with_context(|| format!("failed to connect to postgres at {}:{}", config.host, config.port))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 마이그레이션 실행
    ///
    /// 적용된 버전 수 반환
    pub async fn run_migrations(&self) -> Result<usize> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version    BIGINT PRIMARY KEY,
                name       TEXT NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        let applied: Vec<(i64,)> = sqlx::query_as("SELECT version FROM schema_migrations")
            .fetch_all(&self.pool)
            .await?;
        let applied: Vec<i64> = applied.into_iter().map(|(v,)| v).collect();

        let mut count = 0;
        for (version, name, sql) in MIGRATIONS {
            if applied.contains(version) {
                continue;
            }

            let mut tx = self.pool.begin().await?;
            (&mut *tx)
                .execute(*sql)
                .await
                .with_context(|| format!("migration {:04}_{} failed", version, name))?;
            sqlx::query("INSERT INTO schema_migrations (version, name) VALUES ($1, $2)")
                .bind(version)
                .bind(name)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;

            tracing::info!(version, name, "applied migration");
            count += 1;
        }

        Ok(count)
    }

    /// Health check
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// unique 제약 위반 여부 (제약 이름으로 구분)
pub(crate) fn is_unique_violation(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.code().as_deref() == Some("23505") && db_err.constraint() == Some(constraint)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_ordered() {
        let versions: Vec<i64> = MIGRATIONS.iter().map(|(v, _, _)| *v).collect();
        let mut sorted = versions.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(versions, sorted);
        assert!(MIGRATIONS.iter().all(|(_, _, sql)| !sql.trim().is_empty()));
    }
}
