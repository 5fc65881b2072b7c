//! Strategy instance persistence.
//!
//! The desired-active flag belongs to the owner (external API); the
//! engine owns `status`, `health_message`, the error counter and the
//! opaque state blob.

use chrono::Utc;
use market_types::{StrategyInstance, StrategyParams, StrategyStatus};
use tracing::warn;

use crate::models::DbStrategy;
use crate::{retry_query, Result, TimeSeriesStore};

/// Input for creating a strategy instance (normally done by the external
/// API; used directly in tests).
#[derive(Debug, Clone)]
pub struct NewStrategy {
    pub owner_id: i64,
    pub exchange_config_id: i64,
    pub name: String,
    pub exchange: String,
    pub symbol: String,
    pub params: StrategyParams,
    pub desired_active: bool,
}

/// Result of an engine load: instances ready to manage plus rows whose
/// parameters failed validation.
#[derive(Debug, Default)]
pub struct LoadedStrategies {
    pub ready: Vec<StrategyInstance>,
    pub rejected: Vec<(i64, String)>,
}

const SELECT_COLUMNS: &str = "id, owner_id, exchange_config_id, name, exchange, symbol, params, \
     desired_active, status, health_message, last_eval_at, consecutive_errors, state";

impl TimeSeriesStore {
    pub async fn insert_strategy(&self, new: &NewStrategy) -> Result<i64> {
        let now = Utc::now().timestamp_millis();
        let params = serde_json::to_string(&new.params)?;
        let result = retry_query!(sqlx::query(
            r#"
            INSERT INTO strategies
                (owner_id, exchange_config_id, name, exchange, symbol, params,
                 desired_active, status, consecutive_errors, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 'pending_start', 0, ?, ?)
            "#,
        )
        .bind(new.owner_id)
        .bind(new.exchange_config_id)
        .bind(&new.name)
        .bind(&new.exchange)
        .bind(&new.symbol)
        .bind(&params)
        .bind(new.desired_active)
        .bind(now)
        .bind(now)
        .execute(self.pool()))?;
        Ok(result.last_insert_rowid())
    }

    /// Everything the engine should be managing: desired-active plus
    /// anything still marked pending or running.
    pub async fn load_engine_strategies(&self) -> Result<LoadedStrategies> {
        let rows: Vec<DbStrategy> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM strategies \
             WHERE desired_active = 1 OR status IN ('pending_start', 'running')"
        ))
        .fetch_all(self.pool())
        .await?;

        let mut loaded = LoadedStrategies::default();
        for row in rows {
            let id = row.id;
            match row.into_instance() {
                Ok(instance) => loaded.ready.push(instance),
                Err(err) => {
                    warn!(strategy_id = id, error = %err, "rejecting strategy at load");
                    loaded.rejected.push((id, err.to_string()));
                }
            }
        }
        Ok(loaded)
    }

    pub async fn get_strategy(&self, id: i64) -> Result<Option<StrategyInstance>> {
        let row: Option<DbStrategy> =
            sqlx::query_as(&format!("SELECT {SELECT_COLUMNS} FROM strategies WHERE id = ?"))
                .bind(id)
                .fetch_optional(self.pool())
                .await?;
        row.map(DbStrategy::into_instance).transpose()
    }

    pub async fn update_strategy_status(
        &self,
        id: i64,
        status: StrategyStatus,
        health_message: Option<&str>,
    ) -> Result<()> {
        retry_query!(sqlx::query(
            "UPDATE strategies SET status = ?, health_message = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(health_message)
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(self.pool()))?;
        Ok(())
    }

    pub async fn set_desired_active(&self, id: i64, desired_active: bool) -> Result<()> {
        retry_query!(sqlx::query(
            "UPDATE strategies SET desired_active = ?, updated_at = ? WHERE id = ?",
        )
        .bind(desired_active)
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(self.pool()))?;
        Ok(())
    }

    pub async fn record_evaluation(
        &self,
        id: i64,
        last_eval_at: i64,
        consecutive_errors: u32,
    ) -> Result<()> {
        retry_query!(sqlx::query(
            "UPDATE strategies SET last_eval_at = ?, consecutive_errors = ?, updated_at = ? WHERE id = ?",
        )
        .bind(last_eval_at)
        .bind(consecutive_errors as i64)
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(self.pool()))?;
        Ok(())
    }

    pub async fn save_strategy_state(&self, id: i64, state: &serde_json::Value) -> Result<()> {
        retry_query!(sqlx::query(
            "UPDATE strategies SET state = ?, updated_at = ? WHERE id = ?",
        )
        .bind(serde_json::to_string(state)?)
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(self.pool()))?;
        Ok(())
    }
}
