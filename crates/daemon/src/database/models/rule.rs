use std::path::PathBuf;

use object_store::RemoteTarget;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::database::Database;

/// Mapping between a local directory root and a remote storage target.
///
/// Rules are immutable once imported; every node references one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: Uuid,
    pub local_root: PathBuf,
    pub remote_target: RemoteTarget,
    pub created_at: OffsetDateTime,
}

impl Rule {
    /// A rule with a freshly allocated id.
    pub fn new(local_root: PathBuf, remote_target: RemoteTarget) -> Self {
        Self::with_id(Uuid::new_v4(), local_root, remote_target)
    }

    pub fn with_id(id: Uuid, local_root: PathBuf, remote_target: RemoteTarget) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id,
            local_root,
            remote_target,
            created_at: now.replace_nanosecond(0).unwrap_or(now),
        }
    }

    /// Object key of `relative` under this rule.
    pub fn object_key(&self, relative: &str) -> String {
        self.remote_target.object_key(&self.id.to_string(), relative)
    }

    /// Prefix every object key of this rule starts with.
    pub fn object_prefix(&self) -> String {
        self.remote_target.scope_prefix(&self.id.to_string())
    }
}

impl Database {
    /// Insert rules atomically: either all of them land or none do.
    pub async fn insert_rules(&self, rules: &[Rule]) -> Result<(), sqlx::Error> {
        let mut tx = self.begin().await?;
        for rule in rules {
            sqlx::query(
                r#"
                INSERT INTO rules (id, local_root, remote_target, created_at)
                VALUES (?1, ?2, ?3, ?4)
                "#,
            )
            .bind(rule.id.to_string())
            .bind(rule.local_root.to_string_lossy().to_string())
            .bind(encode_target(&rule.remote_target)?)
            .bind(rule.created_at.unix_timestamp())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }

    pub async fn insert_rule(&self, rule: &Rule) -> Result<(), sqlx::Error> {
        self.insert_rules(std::slice::from_ref(rule)).await
    }

    pub async fn get_rule(&self, id: &Uuid) -> Result<Option<Rule>, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT id, local_root, remote_target, created_at
            FROM rules
            WHERE id = ?1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&**self)
        .await?;

        row.as_ref().map(row_to_rule).transpose()
    }

    pub async fn list_rules(&self) -> Result<Vec<Rule>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, local_root, remote_target, created_at
            FROM rules
            ORDER BY created_at, id
            "#,
        )
        .fetch_all(&**self)
        .await?;

        rows.iter().map(row_to_rule).collect()
    }
}

fn encode_target(target: &RemoteTarget) -> Result<String, sqlx::Error> {
    serde_json::to_string(target).map_err(|e| sqlx::Error::Encode(Box::new(e)))
}

fn row_to_rule(row: &sqlx::sqlite::SqliteRow) -> Result<Rule, sqlx::Error> {
    let id: String = row.try_get("id")?;
    let local_root: String = row.try_get("local_root")?;
    let remote_target: String = row.try_get("remote_target")?;
    let created_at: i64 = row.try_get("created_at")?;

    Ok(Rule {
        id: Uuid::parse_str(&id).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        local_root: PathBuf::from(local_root),
        remote_target: serde_json::from_str(&remote_target)
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        created_at: OffsetDateTime::from_unix_timestamp(created_at)
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
    })
}
