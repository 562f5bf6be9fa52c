use async_trait::async_trait;
use serde_json::json;
use sqlx::PgPool;

use crate::step::{Step, StepContext, StepOutcome};

use super::INIT_DATABASE;

/// Applies pending schema migrations.
pub struct InitDatabaseStep {
    pool: PgPool,
}

impl InitDatabaseStep {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Step for InitDatabaseStep {
    fn name(&self) -> &str {
        INIT_DATABASE
    }

    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    async fn run(&self, _ctx: &StepContext) -> anyhow::Result<StepOutcome> {
        medwh_db::health_check(&self.pool).await?;
        let applied = medwh_db::run_migrations(&self.pool).await?;
        Ok(StepOutcome::Success(json!({ "migrations_applied": applied })))
    }
}
