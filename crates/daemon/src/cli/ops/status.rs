use std::fmt;

use clap::Args;
use comfy_table::Table;
use owo_colors::OwoColorize;
use uuid::Uuid;

use loft_daemon::state::StateError;
use loft_daemon::{EngineError, Node, Pending};

use crate::cli::op::{Op, OpContext};

/// Print the node table
#[derive(Args, Debug, Clone)]
pub struct Status {
    /// Only show nodes of this rule
    #[arg(long)]
    pub rule: Option<Uuid>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug)]
pub enum StatusOutput {
    Json(String),
    Table(Vec<Node>),
}

impl fmt::Display for StatusOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nodes = match self {
            StatusOutput::Json(json) => return write!(f, "{json}"),
            StatusOutput::Table(nodes) => nodes,
        };
        if nodes.is_empty() {
            return write!(f, "{}", "No files tracked".dimmed());
        }

        let mut table = Table::new();
        table.set_header(vec!["Rule", "Path", "Size", "Local", "Pending"]);
        for node in nodes {
            let pending = match node.pending {
                Pending::None => node.pending.to_string(),
                other => other.yellow().to_string(),
            };
            table.add_row(vec![
                node.rule_id.to_string(),
                node.path.clone(),
                node.size.to_string(),
                if node.local { "yes" } else { "stub" }.to_string(),
                pending,
            ]);
        }
        writeln!(f, "{table}")?;

        let stubs = nodes.iter().filter(|node| node.is_stub()).count();
        write!(
            f,
            "{} files, {} evicted",
            nodes.len().to_string().bold(),
            stubs
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[async_trait::async_trait]
impl Op for Status {
    type Error = StatusError;
    type Output = StatusOutput;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        let state = ctx.state()?;
        let db = state.open_database().await?;
        let nodes = collect_nodes(&db, self.rule).await;
        db.close().await;
        let nodes = nodes?;

        if self.json {
            return Ok(StatusOutput::Json(serde_json::to_string_pretty(&nodes)?));
        }
        Ok(StatusOutput::Table(nodes))
    }
}

async fn collect_nodes(
    db: &loft_daemon::Database,
    rule: Option<Uuid>,
) -> Result<Vec<Node>, EngineError> {
    let rules = match rule {
        Some(id) => vec![db
            .get_rule(&id)
            .await?
            .ok_or(EngineError::UnknownRule(id))?],
        None => db.list_rules().await?,
    };

    let mut nodes = Vec::new();
    for rule in rules {
        nodes.extend(db.list_nodes(&rule.id).await?);
    }
    Ok(nodes)
}
