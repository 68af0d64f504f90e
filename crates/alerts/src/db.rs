//! SQLite rule store: rule definitions, trigger history, delivery attempts,
//! in-app notification queue, user profiles and rate-limit counters.

use crate::rate_limit::RateCounter;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use sentinel_core::{
    AlertRule, Channel, ConditionMet, DeliveryAttempt, DeliveryState, Frequency, QuietHours,
    RuleCondition, SubscriptionTier, TriggerEvent, UserProfile,
};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Rule not found: {0}")]
    RuleNotFound(i64),
    #[error("Invalid rule: {0}")]
    InvalidRule(String),
}

/// A row that could not be turned into a rule.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedRule {
    pub rule_id: i64,
    pub user_id: String,
    pub reason: String,
}

/// Result of loading active rules.
#[derive(Debug, Clone, Default)]
pub struct LoadedRules {
    pub rules: Vec<AlertRule>,
    pub malformed: Vec<MalformedRule>,
}

/// A trigger that met its condition but was held back by the daily ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuppressedTrigger {
    pub id: i64,
    pub rule_id: i64,
    pub user_id: String,
    pub symbol: String,
    pub kind: String,
    pub ceiling: u32,
    pub suppressed_at: DateTime<Utc>,
}

/// Row in the in-app notification queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InAppNotification {
    pub id: i64,
    pub user_id: String,
    pub trigger_id: Option<i64>,
    pub title: String,
    pub message: String,
    pub data: serde_json::Value,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

type RuleRow = (
    i64,
    String,
    String,
    String,
    String,
    String,
    String,
    bool,
    Option<i64>,
    i64,
    i64,
);

const RULE_COLUMNS: &str = "id, user_id, symbol, name, parameters, frequency, channels, \
     is_active, last_triggered_at, trigger_count, created_at";

type TriggerRow = (i64, i64, String, String, String, String, String, String, String, i64);

fn to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn rule_from_row(row: RuleRow) -> Result<AlertRule, MalformedRule> {
    let (
        id,
        user_id,
        symbol,
        name,
        parameters,
        frequency,
        channels,
        is_active,
        last_triggered_at,
        trigger_count,
        created_at,
    ) = row;

    let malformed = |reason: String| MalformedRule {
        rule_id: id,
        user_id: user_id.clone(),
        reason,
    };

    let condition: RuleCondition = serde_json::from_str(&parameters)
        .map_err(|e| malformed(format!("parameters: {}", e)))?;
    let frequency = Frequency::parse(&frequency)
        .ok_or_else(|| malformed(format!("unknown frequency '{}'", frequency)))?;
    let channels: Vec<Channel> = serde_json::from_str(&channels)
        .map_err(|e| malformed(format!("channels: {}", e)))?;

    Ok(AlertRule {
        id,
        user_id,
        symbol: symbol.into(),
        name,
        condition,
        frequency,
        channels,
        is_active,
        last_triggered_at: last_triggered_at.map(from_millis),
        trigger_count: trigger_count.max(0) as u32,
        created_at: from_millis(created_at),
    })
}

fn trigger_from_row(row: TriggerRow) -> Result<TriggerEvent, DbError> {
    let (id, rule_id, user_id, symbol, rule_name, kind, condition, market_data, channels, at) = row;
    Ok(TriggerEvent {
        id,
        rule_id,
        user_id,
        symbol: symbol.into(),
        rule_name,
        kind,
        condition: serde_json::from_str::<ConditionMet>(&condition)?,
        market_data: serde_json::from_str(&market_data)?,
        channels: serde_json::from_str(&channels)?,
        triggered_at: from_millis(at),
    })
}

fn parse_state(state: &str, error: Option<String>) -> DeliveryState {
    let reason = error.unwrap_or_default();
    match state {
        "sent" => DeliveryState::Sent,
        "failed" => DeliveryState::Failed { reason },
        "skipped" => DeliveryState::Skipped { reason },
        _ => DeliveryState::Pending,
    }
}

/// Database connection for the alert engine.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Connect to SQLite database at the given URL.
    pub async fn connect(database_url: &str) -> Result<Self, DbError> {
        let in_memory = database_url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        if !in_memory {
            options = options.journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        }

        // Each in-memory connection is its own database, so keep exactly one alive.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(options).await?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Close the pool; later calls fail.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), DbError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alert_rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                parameters TEXT NOT NULL,
                frequency TEXT NOT NULL,
                channels TEXT NOT NULL DEFAULT '[]',
                is_active INTEGER NOT NULL DEFAULT 1,
                last_triggered_at INTEGER,
                trigger_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_alert_rules_active ON alert_rules(is_active, symbol)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trigger_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                rule_id INTEGER NOT NULL REFERENCES alert_rules(id) ON DELETE CASCADE,
                user_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                rule_name TEXT NOT NULL,
                kind TEXT NOT NULL,
                condition_met TEXT NOT NULL,
                market_data TEXT NOT NULL,
                channels TEXT NOT NULL,
                triggered_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_trigger_events_rule
            ON trigger_events(rule_id, triggered_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS suppressed_triggers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                rule_id INTEGER NOT NULL REFERENCES alert_rules(id) ON DELETE CASCADE,
                user_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                kind TEXT NOT NULL,
                condition_met TEXT NOT NULL,
                market_data TEXT NOT NULL,
                ceiling INTEGER NOT NULL,
                suppressed_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS delivery_attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trigger_id INTEGER NOT NULL REFERENCES trigger_events(id) ON DELETE CASCADE,
                channel TEXT NOT NULL,
                state TEXT NOT NULL,
                error TEXT,
                tries INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL,
                UNIQUE(trigger_id, channel)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS notification_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                trigger_id INTEGER REFERENCES trigger_events(id) ON DELETE SET NULL,
                title TEXT NOT NULL,
                message TEXT NOT NULL,
                data TEXT NOT NULL DEFAULT '{}',
                is_read INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_profiles (
                user_id TEXT PRIMARY KEY,
                email TEXT,
                full_name TEXT NOT NULL DEFAULT '',
                email_enabled INTEGER NOT NULL DEFAULT 0,
                tier TEXT NOT NULL DEFAULT 'free',
                timezone TEXT NOT NULL DEFAULT 'UTC',
                quiet_start TEXT,
                quiet_end TEXT,
                max_alerts_per_day INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rate_limit_counters (
                user_id TEXT NOT NULL,
                day TEXT NOT NULL,
                count INTEGER NOT NULL,
                PRIMARY KEY(user_id, day)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Rule CRUD
    // ------------------------------------------------------------------

    /// Insert a new rule. Returns it with its assigned ID.
    pub async fn create_rule(&self, rule: &AlertRule) -> Result<AlertRule, DbError> {
        rule.condition
            .validate()
            .map_err(|e| DbError::InvalidRule(e.to_string()))?;
        if rule.channels.is_empty() {
            return Err(DbError::InvalidRule("at least one channel required".to_string()));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO alert_rules
                (user_id, symbol, name, kind, parameters, frequency, channels,
                 is_active, last_triggered_at, trigger_count, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&rule.user_id)
        .bind(rule.symbol.as_str())
        .bind(&rule.name)
        .bind(rule.kind())
        .bind(serde_json::to_string(&rule.condition)?)
        .bind(rule.frequency.as_str())
        .bind(serde_json::to_string(&rule.channels)?)
        .bind(rule.is_active)
        .bind(rule.last_triggered_at.map(to_millis))
        .bind(i64::from(rule.trigger_count))
        .bind(to_millis(rule.created_at))
        .execute(&self.pool)
        .await?;

        let mut stored = rule.clone();
        stored.id = result.last_insert_rowid();
        Ok(stored)
    }

    pub async fn get_rule(&self, rule_id: i64) -> Result<Option<AlertRule>, DbError> {
        let row = sqlx::query_as::<_, RuleRow>(&format!(
            "SELECT {} FROM alert_rules WHERE id = ?",
            RULE_COLUMNS
        ))
        .bind(rule_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => rule_from_row(row)
                .map(Some)
                .map_err(|m| DbError::InvalidRule(m.reason)),
            None => Ok(None),
        }
    }

    /// All rules owned by a user, newest first. Malformed rows are skipped.
    pub async fn list_rules_for_user(&self, user_id: &str) -> Result<Vec<AlertRule>, DbError> {
        let rows = sqlx::query_as::<_, RuleRow>(&format!(
            "SELECT {} FROM alert_rules WHERE user_id = ? ORDER BY created_at DESC, id DESC",
            RULE_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut rules = Vec::with_capacity(rows.len());
        for row in rows {
            match rule_from_row(row) {
                Ok(rule) => rules.push(rule),
                Err(m) => warn!(rule_id = m.rule_id, reason = %m.reason, "Skipping malformed rule"),
            }
        }
        Ok(rules)
    }

    /// Update the user-editable fields of a rule.
    pub async fn update_rule(&self, rule: &AlertRule) -> Result<(), DbError> {
        rule.condition
            .validate()
            .map_err(|e| DbError::InvalidRule(e.to_string()))?;

        let result = sqlx::query(
            r#"
            UPDATE alert_rules
            SET name = ?, kind = ?, parameters = ?, frequency = ?, channels = ?, is_active = ?
            WHERE id = ? AND user_id = ?
            "#,
        )
        .bind(&rule.name)
        .bind(rule.kind())
        .bind(serde_json::to_string(&rule.condition)?)
        .bind(rule.frequency.as_str())
        .bind(serde_json::to_string(&rule.channels)?)
        .bind(rule.is_active)
        .bind(rule.id)
        .bind(&rule.user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::RuleNotFound(rule.id));
        }
        Ok(())
    }

    pub async fn set_rule_active(&self, rule_id: i64, active: bool) -> Result<(), DbError> {
        let result = sqlx::query("UPDATE alert_rules SET is_active = ? WHERE id = ?")
            .bind(active)
            .bind(rule_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::RuleNotFound(rule_id));
        }
        Ok(())
    }

    /// Delete a rule and its trigger history. Returns false if nothing matched.
    pub async fn delete_rule(&self, rule_id: i64, user_id: &str) -> Result<bool, DbError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM delivery_attempts WHERE trigger_id IN
                (SELECT id FROM trigger_events WHERE rule_id = ?)
            "#,
        )
        .bind(rule_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM trigger_events WHERE rule_id = ?")
            .bind(rule_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM suppressed_triggers WHERE rule_id = ?")
            .bind(rule_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM alert_rules WHERE id = ? AND user_id = ?")
            .bind(rule_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        tx.commit().await?;
        Ok(true)
    }

    /// Load every active rule.
    pub async fn list_active_rules(&self) -> Result<LoadedRules, DbError> {
        let rows = sqlx::query_as::<_, RuleRow>(&format!(
            "SELECT {} FROM alert_rules WHERE is_active = 1 ORDER BY id",
            RULE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut loaded = LoadedRules::default();
        for row in rows {
            match rule_from_row(row) {
                Ok(rule) => loaded.rules.push(rule),
                Err(m) => loaded.malformed.push(m),
            }
        }
        Ok(loaded)
    }

    // ------------------------------------------------------------------
    // Trigger records
    // ------------------------------------------------------------------

    /// Append a trigger record and update rule bookkeeping in one transaction.
    ///
    /// The bookkeeping update only matches if the rule is still active and its
    /// `last_triggered_at` is unchanged since it was loaded. Returns `None`
    /// (nothing written) when it does not match.
    pub async fn record_trigger(
        &self,
        event: &TriggerEvent,
        loaded_last_triggered_at: Option<DateTime<Utc>>,
    ) -> Result<Option<TriggerEvent>, DbError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE alert_rules
            SET last_triggered_at = ?,
                trigger_count = trigger_count + 1,
                is_active = CASE WHEN frequency = 'once' THEN 0 ELSE is_active END
            WHERE id = ?
              AND is_active = 1
              AND last_triggered_at IS ?
              AND (frequency != 'once' OR last_triggered_at IS NULL)
            "#,
        )
        .bind(to_millis(event.triggered_at))
        .bind(event.rule_id)
        .bind(loaded_last_triggered_at.map(to_millis))
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO trigger_events
                (rule_id, user_id, symbol, rule_name, kind, condition_met, market_data, channels, triggered_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.rule_id)
        .bind(&event.user_id)
        .bind(event.symbol.as_str())
        .bind(&event.rule_name)
        .bind(&event.kind)
        .bind(serde_json::to_string(&event.condition)?)
        .bind(serde_json::to_string(&event.market_data)?)
        .bind(serde_json::to_string(&event.channels)?)
        .bind(to_millis(event.triggered_at))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut stored = event.clone();
        stored.id = result.last_insert_rowid();
        Ok(Some(stored))
    }

    /// Log a trigger suppressed by the daily ceiling.
    pub async fn record_suppressed(&self, event: &TriggerEvent, ceiling: u32) -> Result<i64, DbError> {
        let result = sqlx::query(
            r#"
            INSERT INTO suppressed_triggers
                (rule_id, user_id, symbol, kind, condition_met, market_data, ceiling, suppressed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.rule_id)
        .bind(&event.user_id)
        .bind(event.symbol.as_str())
        .bind(&event.kind)
        .bind(serde_json::to_string(&event.condition)?)
        .bind(serde_json::to_string(&event.market_data)?)
        .bind(i64::from(ceiling))
        .bind(to_millis(event.triggered_at))
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Trigger history for a rule, newest first.
    pub async fn trigger_history(&self, rule_id: i64) -> Result<Vec<TriggerEvent>, DbError> {
        let rows = sqlx::query_as::<_, TriggerRow>(
            r#"
            SELECT id, rule_id, user_id, symbol, rule_name, kind, condition_met, market_data, channels, triggered_at
            FROM trigger_events WHERE rule_id = ?
            ORDER BY triggered_at DESC, id DESC
            "#,
        )
        .bind(rule_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(trigger_from_row).collect()
    }

    pub async fn suppressed_history(&self, user_id: &str) -> Result<Vec<SuppressedTrigger>, DbError> {
        let rows = sqlx::query_as::<_, (i64, i64, String, String, String, i64, i64)>(
            r#"
            SELECT id, rule_id, user_id, symbol, kind, ceiling, suppressed_at
            FROM suppressed_triggers WHERE user_id = ?
            ORDER BY suppressed_at DESC, id DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, rule_id, user_id, symbol, kind, ceiling, at)| SuppressedTrigger {
                id,
                rule_id,
                user_id,
                symbol,
                kind,
                ceiling: ceiling.max(0) as u32,
                suppressed_at: from_millis(at),
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // Delivery attempts
    // ------------------------------------------------------------------

    /// Insert a `pending` attempt for (trigger, channel). Returns its ID.
    pub async fn begin_delivery(&self, trigger_id: i64, channel: Channel) -> Result<i64, DbError> {
        let result = sqlx::query(
            r#"
            INSERT INTO delivery_attempts (trigger_id, channel, state, tries, updated_at)
            VALUES (?, ?, 'pending', 0, ?)
            "#,
        )
        .bind(trigger_id)
        .bind(channel.as_str())
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Commit the outcome of one attempt.
    pub async fn finish_delivery(&self, attempt: &DeliveryAttempt) -> Result<(), DbError> {
        sqlx::query(
            r#"
            UPDATE delivery_attempts
            SET state = ?, error = ?, tries = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(attempt.state.as_str())
        .bind(attempt.state.reason())
        .bind(i64::from(attempt.tries))
        .bind(to_millis(attempt.updated_at))
        .bind(attempt.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delivery_attempts(&self, trigger_id: i64) -> Result<Vec<DeliveryAttempt>, DbError> {
        let rows = sqlx::query_as::<_, (i64, i64, String, String, Option<String>, i64, i64)>(
            r#"
            SELECT id, trigger_id, channel, state, error, tries, updated_at
            FROM delivery_attempts WHERE trigger_id = ? ORDER BY channel
            "#,
        )
        .bind(trigger_id)
        .fetch_all(&self.pool)
        .await?;

        let mut attempts = Vec::with_capacity(rows.len());
        for (id, trigger_id, channel, state, error, tries, updated_at) in rows {
            let Some(channel) = Channel::parse(&channel) else {
                warn!(attempt_id = id, channel = %channel, "Unknown delivery channel");
                continue;
            };
            attempts.push(DeliveryAttempt {
                id,
                trigger_id,
                channel,
                state: parse_state(&state, error),
                tries: tries.clamp(0, i64::from(u8::MAX)) as u8,
                updated_at: from_millis(updated_at),
            });
        }
        Ok(attempts)
    }

    // ------------------------------------------------------------------
    // In-app notification queue
    // ------------------------------------------------------------------

    pub async fn enqueue_notification(
        &self,
        user_id: &str,
        trigger_id: Option<i64>,
        title: &str,
        message: &str,
        data: &serde_json::Value,
    ) -> Result<i64, DbError> {
        let result = sqlx::query(
            r#"
            INSERT INTO notification_queue (user_id, trigger_id, title, message, data, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(trigger_id)
        .bind(title)
        .bind(message)
        .bind(serde_json::to_string(data)?)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn unread_notifications(&self, user_id: &str) -> Result<Vec<InAppNotification>, DbError> {
        let rows = sqlx::query_as::<_, (i64, String, Option<i64>, String, String, String, bool, i64)>(
            r#"
            SELECT id, user_id, trigger_id, title, message, data, is_read, created_at
            FROM notification_queue WHERE user_id = ? AND is_read = 0
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(
                |(id, user_id, trigger_id, title, message, data, is_read, created_at)| {
                    Ok(InAppNotification {
                        id,
                        user_id,
                        trigger_id,
                        title,
                        message,
                        data: serde_json::from_str(&data)?,
                        is_read,
                        created_at: from_millis(created_at),
                    })
                },
            )
            .collect()
    }

    pub async fn mark_notification_read(&self, id: i64, user_id: &str) -> Result<bool, DbError> {
        let result = sqlx::query(
            "UPDATE notification_queue SET is_read = 1 WHERE id = ? AND user_id = ?",
        )
        .bind(id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ------------------------------------------------------------------
    // User profiles
    // ------------------------------------------------------------------

    pub async fn upsert_user_profile(&self, profile: &UserProfile) -> Result<(), DbError> {
        let (quiet_start, quiet_end) = match profile.quiet_hours {
            Some(q) => (
                Some(q.start.format("%H:%M:%S").to_string()),
                Some(q.end.format("%H:%M:%S").to_string()),
            ),
            None => (None, None),
        };

        sqlx::query(
            r#"
            INSERT INTO user_profiles
                (user_id, email, full_name, email_enabled, tier, timezone,
                 quiet_start, quiet_end, max_alerts_per_day)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                email = excluded.email,
                full_name = excluded.full_name,
                email_enabled = excluded.email_enabled,
                tier = excluded.tier,
                timezone = excluded.timezone,
                quiet_start = excluded.quiet_start,
                quiet_end = excluded.quiet_end,
                max_alerts_per_day = excluded.max_alerts_per_day
            "#,
        )
        .bind(&profile.user_id)
        .bind(&profile.email)
        .bind(&profile.full_name)
        .bind(profile.email_enabled)
        .bind(profile.tier.as_str())
        .bind(&profile.timezone)
        .bind(quiet_start)
        .bind(quiet_end)
        .bind(profile.max_alerts_per_day.map(i64::from))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Profile for a user; free-tier UTC defaults when none is stored.
    pub async fn user_profile(&self, user_id: &str) -> Result<UserProfile, DbError> {
        let row = sqlx::query_as::<
            _,
            (
                Option<String>,
                String,
                bool,
                String,
                String,
                Option<String>,
                Option<String>,
                Option<i64>,
            ),
        >(
            r#"
            SELECT email, full_name, email_enabled, tier, timezone,
                   quiet_start, quiet_end, max_alerts_per_day
            FROM user_profiles WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((email, full_name, email_enabled, tier, timezone, quiet_start, quiet_end, max)) = row
        else {
            return Ok(UserProfile::default_for(user_id));
        };

        let parse_time = |s: Option<String>| {
            s.and_then(|s| NaiveTime::parse_from_str(&s, "%H:%M:%S").ok())
        };
        let quiet_hours = match (parse_time(quiet_start), parse_time(quiet_end)) {
            (Some(start), Some(end)) => Some(QuietHours::new(start, end)),
            _ => None,
        };

        Ok(UserProfile {
            user_id: user_id.to_string(),
            email,
            full_name,
            email_enabled,
            tier: SubscriptionTier::parse(&tier).unwrap_or_default(),
            timezone,
            quiet_hours,
            max_alerts_per_day: max.and_then(|m| u32::try_from(m).ok()),
        })
    }

    // ------------------------------------------------------------------
    // Rate-limit counters
    // ------------------------------------------------------------------

    /// Single-statement check-and-increment.
    pub async fn increment_counter(
        &self,
        user_id: &str,
        day: NaiveDate,
        ceiling: u32,
    ) -> Result<bool, DbError> {
        if ceiling == 0 {
            return Ok(false);
        }
        let row = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO rate_limit_counters (user_id, day, count) VALUES (?, ?, 1)
            ON CONFLICT(user_id, day) DO UPDATE SET count = count + 1
            WHERE rate_limit_counters.count < ?
            RETURNING count
            "#,
        )
        .bind(user_id)
        .bind(day.to_string())
        .bind(i64::from(ceiling))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Give back one unit that did not end in a firing. Never goes below zero.
    pub async fn decrement_counter(&self, user_id: &str, day: NaiveDate) -> Result<bool, DbError> {
        let result = sqlx::query(
            "UPDATE rate_limit_counters SET count = count - 1 WHERE user_id = ? AND day = ? AND count > 0",
        )
        .bind(user_id)
        .bind(day.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn counter_value(&self, user_id: &str, day: NaiveDate) -> Result<u32, DbError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT count FROM rate_limit_counters WHERE user_id = ? AND day = ?",
        )
        .bind(user_id)
        .bind(day.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(count.unwrap_or(0).max(0) as u32)
    }

    // ------------------------------------------------------------------
    // Retention
    // ------------------------------------------------------------------

    /// Delete history older than `days`. Returns rows removed.
    pub async fn cleanup_old_history(&self, days: i64) -> Result<u64, DbError> {
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let cutoff_ms = to_millis(cutoff);
        let mut tx = self.pool.begin().await?;

        let mut removed = sqlx::query(
            r#"
            DELETE FROM delivery_attempts WHERE trigger_id IN
                (SELECT id FROM trigger_events WHERE triggered_at < ?)
            "#,
        )
        .bind(cutoff_ms)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        removed += sqlx::query("DELETE FROM trigger_events WHERE triggered_at < ?")
            .bind(cutoff_ms)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        removed += sqlx::query("DELETE FROM suppressed_triggers WHERE suppressed_at < ?")
            .bind(cutoff_ms)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        removed += sqlx::query("DELETE FROM notification_queue WHERE is_read = 1 AND created_at < ?")
            .bind(cutoff_ms)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        removed += sqlx::query("DELETE FROM rate_limit_counters WHERE day < ?")
            .bind(cutoff.date_naive().to_string())
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(removed)
    }
}

#[async_trait]
impl RateCounter for Database {
    async fn try_increment(
        &self,
        user_id: &str,
        day: NaiveDate,
        ceiling: u32,
    ) -> Result<bool, DbError> {
        self.increment_counter(user_id, day, ceiling).await
    }

    async fn release(&self, user_id: &str, day: NaiveDate) -> Result<(), DbError> {
        self.decrement_counter(user_id, day).await.map(|_| ())
    }

    async fn count(&self, user_id: &str, day: NaiveDate) -> Result<u32, DbError> {
        self.counter_value(user_id, day).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use sentinel_core::Comparison;

    fn price_rule(user: &str, frequency: Frequency) -> AlertRule {
        AlertRule::new(
            user,
            "AAPL",
            RuleCondition::PriceAbove { threshold: 150.0 },
            frequency,
        )
        .with_channels(&[Channel::Email, Channel::InApp])
    }

    fn event_for(rule: &AlertRule, at: DateTime<Utc>) -> TriggerEvent {
        TriggerEvent::new(
            rule,
            ConditionMet::Price {
                price: 152.0,
                threshold: 150.0,
                comparison: Comparison::Above,
            },
            serde_json::json!({"price": 152.0}),
            at,
        )
    }

    #[tokio::test]
    async fn test_database_connect_and_create_rule() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let rule = db.create_rule(&price_rule("u1", Frequency::Daily)).await.unwrap();
        assert!(rule.id > 0);

        let loaded = db.get_rule(rule.id).await.unwrap().unwrap();
        assert_eq!(loaded.condition, rule.condition);
        assert_eq!(loaded.channels, vec![Channel::Email, Channel::InApp]);
        assert_eq!(loaded.frequency, Frequency::Daily);
        assert!(loaded.is_active);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_parameters() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let rule = AlertRule::new(
            "u1",
            "AAPL",
            RuleCondition::PriceAbove { threshold: 0.0 },
            Frequency::Once,
        );
        assert!(matches!(
            db.create_rule(&rule).await,
            Err(DbError::InvalidRule(_))
        ));
    }

    #[tokio::test]
    async fn test_update_and_list_rules() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let mut rule = db.create_rule(&price_rule("u1", Frequency::Daily)).await.unwrap();
        db.create_rule(&price_rule("u2", Frequency::Daily)).await.unwrap();

        rule.condition = RuleCondition::PriceBelow { threshold: 120.0 };
        rule.frequency = Frequency::Always;
        db.update_rule(&rule).await.unwrap();

        let rules = db.list_rules_for_user("u1").await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].kind(), "price_below");
        assert_eq!(rules[0].frequency, Frequency::Always);

        rule.id = 9999;
        assert!(matches!(
            db.update_rule(&rule).await,
            Err(DbError::RuleNotFound(9999))
        ));
    }

    #[tokio::test]
    async fn test_malformed_rows_reported() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        db.create_rule(&price_rule("u1", Frequency::Daily)).await.unwrap();
        sqlx::query(
            "INSERT INTO alert_rules (user_id, symbol, name, kind, parameters, frequency, created_at)
             VALUES ('u1', 'MSFT', 'bad', 'price_above', '{\"kind\":\"price_above\"}', 'daily', 0)",
        )
        .execute(&db.pool)
        .await
        .unwrap();

        let loaded = db.list_active_rules().await.unwrap();
        assert_eq!(loaded.rules.len(), 1);
        assert_eq!(loaded.malformed.len(), 1);
        assert_eq!(loaded.malformed[0].user_id, "u1");
    }

    #[tokio::test]
    async fn test_record_trigger_once_deactivates() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let rule = db.create_rule(&price_rule("u1", Frequency::Once)).await.unwrap();
        let now = Utc::now();

        let stored = db.record_trigger(&event_for(&rule, now), None).await.unwrap().unwrap();
        assert!(stored.id > 0);

        let after = db.get_rule(rule.id).await.unwrap().unwrap();
        assert!(!after.is_active);
        assert_eq!(after.trigger_count, 1);
        assert_eq!(
            after.last_triggered_at.map(|t| t.timestamp_millis()),
            Some(now.timestamp_millis())
        );

        // A stale second invocation must not fire again.
        let again = db.record_trigger(&event_for(&rule, now), None).await.unwrap();
        assert!(again.is_none());
        assert_eq!(db.trigger_history(rule.id).await.unwrap().len(), 1);
        assert!(db.list_active_rules().await.unwrap().rules.is_empty());
    }

    #[tokio::test]
    async fn test_record_trigger_requires_unchanged_last_trigger() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let rule = db.create_rule(&price_rule("u1", Frequency::Daily)).await.unwrap();
        let t1 = Utc::now() - Duration::days(2);

        db.record_trigger(&event_for(&rule, t1), None).await.unwrap().unwrap();
        // Stale view (None) is rejected.
        assert!(db
            .record_trigger(&event_for(&rule, Utc::now()), None)
            .await
            .unwrap()
            .is_none());
        // Fresh view succeeds.
        let loaded = db.get_rule(rule.id).await.unwrap().unwrap();
        assert!(db
            .record_trigger(&event_for(&loaded, Utc::now()), loaded.last_triggered_at)
            .await
            .unwrap()
            .is_some());

        let after = db.get_rule(rule.id).await.unwrap().unwrap();
        assert_eq!(after.trigger_count, 2);
        assert!(after.is_active);
    }

    #[tokio::test]
    async fn test_delivery_attempts_and_cascade_delete() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let rule = db.create_rule(&price_rule("u1", Frequency::Always)).await.unwrap();
        let event = db
            .record_trigger(&event_for(&rule, Utc::now()), None)
            .await
            .unwrap()
            .unwrap();

        let email_id = db.begin_delivery(event.id, Channel::Email).await.unwrap();
        let in_app_id = db.begin_delivery(event.id, Channel::InApp).await.unwrap();

        let mut email = DeliveryAttempt::pending(event.id, Channel::Email);
        email.id = email_id;
        email.tries = 2;
        email.state = DeliveryState::Failed {
            reason: "relay down".to_string(),
        };
        db.finish_delivery(&email).await.unwrap();

        let attempts = db.delivery_attempts(event.id).await.unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].channel, Channel::Email);
        assert_eq!(
            attempts[0].state,
            DeliveryState::Failed {
                reason: "relay down".to_string()
            }
        );
        assert_eq!(attempts[0].tries, 2);
        assert_eq!(attempts[1].id, in_app_id);
        assert_eq!(attempts[1].state, DeliveryState::Pending);

        assert!(db.delete_rule(rule.id, "u1").await.unwrap());
        assert!(db.trigger_history(rule.id).await.unwrap().is_empty());
        assert!(db.delivery_attempts(event.id).await.unwrap().is_empty());
        assert!(!db.delete_rule(rule.id, "u1").await.unwrap());
    }

    #[tokio::test]
    async fn test_suppressed_history() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let rule = db.create_rule(&price_rule("u1", Frequency::Always)).await.unwrap();
        db.record_suppressed(&event_for(&rule, Utc::now()), 20).await.unwrap();

        let history = db.suppressed_history("u1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].ceiling, 20);
        assert_eq!(history[0].kind, "price_above");
        // Suppression does not touch bookkeeping.
        let after = db.get_rule(rule.id).await.unwrap().unwrap();
        assert_eq!(after.trigger_count, 0);
    }

    #[tokio::test]
    async fn test_user_profile_roundtrip_and_default() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        assert_eq!(
            db.user_profile("nobody").await.unwrap(),
            UserProfile::default_for("nobody")
        );

        let mut profile = UserProfile::default_for("u1");
        profile.email = Some("u1@example.com".to_string());
        profile.email_enabled = true;
        profile.tier = SubscriptionTier::Premium;
        profile.timezone = "America/Chicago".to_string();
        profile.quiet_hours = Some(QuietHours::new(
            NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(7, 0, 0).unwrap(),
        ));
        profile.max_alerts_per_day = Some(15);
        db.upsert_user_profile(&profile).await.unwrap();
        assert_eq!(db.user_profile("u1").await.unwrap(), profile);

        profile.tier = SubscriptionTier::Enterprise;
        db.upsert_user_profile(&profile).await.unwrap();
        assert_eq!(db.user_profile("u1").await.unwrap().tier, SubscriptionTier::Enterprise);
    }

    #[tokio::test]
    async fn test_counter_increment_respects_ceiling() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        assert!(db.increment_counter("u1", day, 2).await.unwrap());
        assert!(db.increment_counter("u1", day, 2).await.unwrap());
        assert!(!db.increment_counter("u1", day, 2).await.unwrap());
        assert_eq!(db.counter_value("u1", day).await.unwrap(), 2);
        assert!(!db.increment_counter("u2", day, 0).await.unwrap());
        assert_eq!(db.counter_value("u2", day).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_counter_decrement_floors_at_zero() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        assert!(!db.decrement_counter("u1", day).await.unwrap());

        assert!(db.increment_counter("u1", day, 1).await.unwrap());
        assert!(!db.increment_counter("u1", day, 1).await.unwrap());
        assert!(db.decrement_counter("u1", day).await.unwrap());
        assert_eq!(db.counter_value("u1", day).await.unwrap(), 0);
        assert!(!db.decrement_counter("u1", day).await.unwrap());
        assert!(db.increment_counter("u1", day, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_notification_queue() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let id = db
            .enqueue_notification("u1", None, "AAPL Price Above", "crossed", &serde_json::json!({"a": 1}))
            .await
            .unwrap();
        let unread = db.unread_notifications("u1").await.unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].data["a"], 1);
        assert!(db.mark_notification_read(id, "u1").await.unwrap());
        assert!(db.unread_notifications("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_old_history() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let rule = db.create_rule(&price_rule("u1", Frequency::Always)).await.unwrap();
        let old = Utc::now() - Duration::days(120);
        let event = db.record_trigger(&event_for(&rule, old), None).await.unwrap().unwrap();
        db.begin_delivery(event.id, Channel::InApp).await.unwrap();
        db.increment_counter("u1", old.date_naive(), 5).await.unwrap();

        let removed = db.cleanup_old_history(90).await.unwrap();
        assert_eq!(removed, 3);
        assert!(db.trigger_history(rule.id).await.unwrap().is_empty());
        // The rule itself is kept.
        assert!(db.get_rule(rule.id).await.unwrap().is_some());
    }
}
