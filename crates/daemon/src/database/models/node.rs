use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

use crate::database::types::Pending;
use crate::database::{now_unix, Database};

/// Identity of a node: its rule plus the `/`-separated path under the rule root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey {
    pub rule_id: Uuid,
    pub path: String,
}

impl NodeKey {
    pub fn new(rule_id: Uuid, path: impl Into<String>) -> Self {
        Self {
            rule_id,
            path: path.into(),
        }
    }
}

impl std::fmt::Display for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.rule_id, self.path)
    }
}

/// Metadata record for one synchronized file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub rule_id: Uuid,
    pub path: String,
    pub size: u64,
    pub local: bool,
    pub pending: Pending,
}

impl Node {
    /// Freshly written file, before its first stable scan.
    pub fn created(key: &NodeKey) -> Self {
        Self::resident(key, 0)
    }

    /// Content held in the local cache.
    pub fn resident(key: &NodeKey, size: u64) -> Self {
        Self {
            rule_id: key.rule_id,
            path: key.path.clone(),
            size,
            local: true,
            pending: Pending::None,
        }
    }

    /// Local bytes evicted, content lives remotely.
    pub fn evicted(key: &NodeKey, size: u64) -> Self {
        Self {
            rule_id: key.rule_id,
            path: key.path.clone(),
            size,
            local: false,
            pending: Pending::Remote,
        }
    }

    pub fn key(&self) -> NodeKey {
        NodeKey::new(self.rule_id, self.path.clone())
    }

    pub fn is_stub(&self) -> bool {
        !self.local
    }

    /// `(size, local, pending)`, the triple tests assert on.
    pub fn state(&self) -> (u64, bool, Pending) {
        (self.size, self.local, self.pending)
    }
}

impl Database {
    pub async fn get_node(&self, key: &NodeKey) -> Result<Option<Node>, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT rule_id, path, size, local, pending
            FROM nodes
            WHERE rule_id = ?1 AND path = ?2
            "#,
        )
        .bind(key.rule_id.to_string())
        .bind(&key.path)
        .fetch_optional(&**self)
        .await?;

        row.as_ref().map(row_to_node).transpose()
    }

    pub async fn list_nodes(&self, rule_id: &Uuid) -> Result<Vec<Node>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT rule_id, path, size, local, pending
            FROM nodes
            WHERE rule_id = ?1
            ORDER BY path
            "#,
        )
        .bind(rule_id.to_string())
        .fetch_all(&**self)
        .await?;

        rows.iter().map(row_to_node).collect()
    }

    /// Insert or overwrite the node.
    pub async fn upsert_node(&self, node: &Node) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO nodes (rule_id, path, size, local, pending, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(rule_id, path) DO UPDATE SET
                size = excluded.size,
                local = excluded.local,
                pending = excluded.pending,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(node.rule_id.to_string())
        .bind(&node.path)
        .bind(node.size as i64)
        .bind(node.local)
        .bind(node.pending)
        .bind(now_unix())
        .execute(&**self)
        .await?;

        Ok(())
    }

    pub async fn delete_node(&self, key: &NodeKey) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM nodes WHERE rule_id = ?1 AND path = ?2")
            .bind(key.rule_id.to_string())
            .bind(&key.path)
            .execute(&**self)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Move a node to a new path, replacing whatever was recorded there.
    pub async fn rename_node(&self, from: &NodeKey, to: &NodeKey) -> Result<bool, sqlx::Error> {
        let mut tx = self.begin().await?;

        sqlx::query("DELETE FROM nodes WHERE rule_id = ?1 AND path = ?2")
            .bind(to.rule_id.to_string())
            .bind(&to.path)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query(
            r#"
            UPDATE nodes
            SET rule_id = ?3, path = ?4, updated_at = ?5
            WHERE rule_id = ?1 AND path = ?2
            "#,
        )
        .bind(from.rule_id.to_string())
        .bind(&from.path)
        .bind(to.rule_id.to_string())
        .bind(&to.path)
        .bind(now_unix())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    /// Replace every node of a rule in one transaction.
    pub async fn replace_nodes(&self, rule_id: &Uuid, nodes: &[Node]) -> Result<(), sqlx::Error> {
        let mut tx = self.begin().await?;

        sqlx::query("DELETE FROM nodes WHERE rule_id = ?1")
            .bind(rule_id.to_string())
            .execute(&mut *tx)
            .await?;

        let now = now_unix();
        for node in nodes {
            sqlx::query(
                r#"
                INSERT INTO nodes (rule_id, path, size, local, pending, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )
            .bind(node.rule_id.to_string())
            .bind(&node.path)
            .bind(node.size as i64)
            .bind(node.local)
            .bind(node.pending)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await
    }

    pub async fn count_nodes(&self, rule_id: &Uuid) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM nodes WHERE rule_id = ?1")
            .bind(rule_id.to_string())
            .fetch_one(&**self)
            .await
    }
}

fn row_to_node(row: &sqlx::sqlite::SqliteRow) -> Result<Node, sqlx::Error> {
    let rule_id: String = row.try_get("rule_id")?;
    let size: i64 = row.try_get("size")?;

    Ok(Node {
        rule_id: Uuid::parse_str(&rule_id).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        path: row.try_get("path")?,
        size: size.max(0) as u64,
        local: row.try_get("local")?,
        pending: row.try_get("pending")?,
    })
}
