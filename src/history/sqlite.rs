//! SQLite alert history
//!
//! Timestamps are stored as Unix milliseconds and the node set as a JSON
//! array. The schema lives in `migrations/` and is applied on open.

use std::{collections::BTreeSet, path::Path, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    Pool, QueryBuilder, Row, Sqlite,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous},
};
use tracing::{debug, info, instrument};

use super::{
    AlertHistory, HistoryEntry, HistoryError, HistoryFilter, HistoryResult, HistoryStats,
};
use crate::alerts::Alert;

pub struct SqliteHistory {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl std::fmt::Debug for SqliteHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteHistory")
            .field("db_path", &self.db_path)
            .finish()
    }
}

impl SqliteHistory {
    /// Open (or create) the database at `db_path` and run migrations
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> HistoryResult<Self> {
        let db_path = db_path.as_ref().to_string_lossy().to_string();
        info!("opening alert history at {db_path}");

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| HistoryError::ConnectionFailed(e.to_string()))?;

        debug!("running alert history migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool, db_path })
    }

    pub fn path(&self) -> &str {
        &self.db_path
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn millis_to_timestamp(millis: i64) -> HistoryResult<DateTime<Utc>> {
        DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| HistoryError::CorruptRow(format!("timestamp {millis} out of range")))
    }

    fn entry_from_row(row: &SqliteRow) -> HistoryResult<HistoryEntry> {
        let level: String = row.try_get("level")?;
        let operator: String = row.try_get("operator")?;
        let nodes: String = row.try_get("nodes")?;
        let nodes: BTreeSet<String> = serde_json::from_str(&nodes)?;
        let resolved_at: Option<i64> = row.try_get("resolved_at")?;

        Ok(HistoryEntry {
            id: row.try_get("id")?,
            alert: Alert {
                metric: row.try_get("metric")?,
                observed_value: row.try_get("observed_value")?,
                threshold_value: row.try_get("threshold_value")?,
                operator: operator
                    .parse()
                    .map_err(|e| HistoryError::CorruptRow(format!("{e}")))?,
                level: level
                    .parse()
                    .map_err(|e| HistoryError::CorruptRow(format!("{e}")))?,
                source_node: row.try_get("source_node")?,
                raised_at: Self::millis_to_timestamp(row.try_get("raised_at")?)?,
                nodes,
            },
            resolved: row.try_get::<i64, _>("resolved")? != 0,
            resolved_at: resolved_at.map(Self::millis_to_timestamp).transpose()?,
        })
    }
}

#[async_trait]
impl AlertHistory for SqliteHistory {
    #[instrument(skip_all, fields(metric = %alert.metric))]
    async fn append(&self, alert: &Alert) -> HistoryResult<i64> {
        let nodes = serde_json::to_string(&alert.nodes)?;

        let result = sqlx::query(
            r#"
            INSERT INTO alert_history (
                raised_at, level, metric, observed_value, threshold_value,
                operator, source_node, nodes
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(alert.raised_at.timestamp_millis())
        .bind(alert.level.as_str())
        .bind(&alert.metric)
        .bind(alert.observed_value)
        .bind(alert.threshold_value)
        .bind(alert.operator.as_str())
        .bind(&alert.source_node)
        .bind(nodes)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        debug!("stored alert {id}");
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn resolve(&self, id: i64) -> HistoryResult<bool> {
        let result = sqlx::query(
            "UPDATE alert_history SET resolved = 1, resolved_at = ? WHERE id = ? AND resolved = 0",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn query(&self, filter: &HistoryFilter) -> HistoryResult<Vec<HistoryEntry>> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, raised_at, level, metric, observed_value, threshold_value, operator, \
             source_node, nodes, resolved, resolved_at FROM alert_history WHERE 1=1",
        );

        if let Some(level) = filter.level {
            builder.push(" AND level = ").push_bind(level.as_str());
        }
        if let Some(metric) = &filter.metric {
            builder.push(" AND metric = ").push_bind(metric.clone());
        }
        if let Some(source) = &filter.source {
            builder.push(" AND source_node = ").push_bind(source.clone());
        }
        if let Some(resolved) = filter.resolved {
            builder.push(" AND resolved = ").push_bind(i64::from(resolved));
        }
        builder
            .push(" ORDER BY raised_at DESC, id DESC LIMIT ")
            .push_bind(filter.limit as i64);

        let rows = builder.build().fetch_all(&self.pool).await?;
        let entries = rows
            .iter()
            .map(Self::entry_from_row)
            .collect::<HistoryResult<Vec<_>>>()?;

        debug!("history query returned {} entries", entries.len());
        Ok(entries)
    }

    async fn stats(&self) -> HistoryResult<HistoryStats> {
        let totals = sqlx::query(
            "SELECT COUNT(*) AS total, COALESCE(SUM(resolved), 0) AS resolved FROM alert_history",
        )
        .fetch_one(&self.pool)
        .await?;

        let mut stats = HistoryStats {
            total: totals.try_get::<i64, _>("total")? as u64,
            resolved: totals.try_get::<i64, _>("resolved")? as u64,
            ..HistoryStats::default()
        };

        let levels =
            sqlx::query("SELECT level, COUNT(*) AS count FROM alert_history GROUP BY level")
                .fetch_all(&self.pool)
                .await?;
        for row in levels {
            stats
                .by_level
                .insert(row.try_get("level")?, row.try_get::<i64, _>("count")? as u64);
        }

        let metrics =
            sqlx::query("SELECT metric, COUNT(*) AS count FROM alert_history GROUP BY metric")
                .fetch_all(&self.pool)
                .await?;
        for row in metrics {
            stats
                .by_metric
                .insert(row.try_get("metric")?, row.try_get::<i64, _>("count")? as u64);
        }

        Ok(stats)
    }
}
