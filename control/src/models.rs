use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio_postgres::Row;
use uuid::Uuid;

/// Unix epoch milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Dispatch priority of an outbound queue message. Higher classes are
/// always drained before lower ones; FIFO within a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    /// Wire encoding: 1 = high, 2 = normal, 3 = low.
    pub fn wire(self) -> i32 {
        match self {
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    /// Rank for ordering: lower rank drains first.
    pub fn rank(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl FromStr for Priority {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            _ => Err(anyhow::anyhow!("unknown priority: {}", s)),
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterStatus {
    Pending,
    Active,
    Inactive,
    Failed,
}

impl ClusterStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ClusterStatus::Pending => "PENDING",
            ClusterStatus::Active => "ACTIVE",
            ClusterStatus::Inactive => "INACTIVE",
            ClusterStatus::Failed => "FAILED",
        }
    }
}

impl FromStr for ClusterStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ClusterStatus::Pending),
            "ACTIVE" => Ok(ClusterStatus::Active),
            "INACTIVE" => Ok(ClusterStatus::Inactive),
            "FAILED" => Ok(ClusterStatus::Failed),
            _ => Err(anyhow::anyhow!("unknown cluster status: {}", s)),
        }
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "PENDING",
            ExecutionStatus::Queued => "QUEUED",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }
}

impl FromStr for ExecutionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ExecutionStatus::Pending),
            "QUEUED" => Ok(ExecutionStatus::Queued),
            "RUNNING" => Ok(ExecutionStatus::Running),
            "COMPLETED" => Ok(ExecutionStatus::Completed),
            "FAILED" => Ok(ExecutionStatus::Failed),
            _ => Err(anyhow::anyhow!("unknown execution status: {}", s)),
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Active,
    Disabled,
    Failed,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Active => "ACTIVE",
            AgentStatus::Disabled => "DISABLED",
            AgentStatus::Failed => "FAILED",
        }
    }
}

impl FromStr for AgentStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(AgentStatus::Active),
            "DISABLED" => Ok(AgentStatus::Disabled),
            "FAILED" => Ok(AgentStatus::Failed),
            _ => Err(anyhow::anyhow!("unknown agent status: {}", s)),
        }
    }
}

/// One message on a `(organization, cluster)` dispatch queue. Lives from
/// enqueue until it is written to the relayer stream; never the primary
/// record of anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueMessage {
    Work {
        execution_id: Uuid,
        agent_name: String,
        input_json: String,
        priority: Priority,
    },
    Registration {
        agent_id: Uuid,
        agent_name: String,
        image: String,
        resources_json: String,
        retry_policy_json: String,
        environment_json: String,
        use_agent_sandbox: bool,
        warm_pool_size: i32,
        network_policy: String,
        config_hash: String,
    },
}

impl QueueMessage {
    pub fn priority(&self) -> Priority {
        match self {
            QueueMessage::Work { priority, .. } => *priority,
            QueueMessage::Registration { .. } => Priority::Normal,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Cluster {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub status: ClusterStatus,
    #[serde(skip)]
    pub secret_hash: String,
    pub relayer_version: Option<String>,
    /// Unix epoch timestamp in milliseconds.
    pub last_heartbeat: Option<i64>,
    /// Unix epoch timestamp in milliseconds.
    pub created_at: i64,
}

impl Cluster {
    pub fn from_row(row: &Row) -> anyhow::Result<Self> {
        Ok(Self {
            id: row.get("id"),
            organization_id: row.get("organization_id"),
            name: row.get("name"),
            status: row.get::<_, String>("status").parse()?,
            secret_hash: row.get("secret_hash"),
            relayer_version: row.get("relayer_version"),
            last_heartbeat: row.get("last_heartbeat"),
            created_at: row.get("created_at"),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Agent {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub image: String,
    pub resources: serde_json::Value,
    pub retry_policy: serde_json::Value,
    pub environment: serde_json::Value,
    pub use_agent_sandbox: bool,
    pub warm_pool_size: i32,
    pub network_policy: String,
    pub status: AgentStatus,
    pub config_hash: String,
    /// Unix epoch timestamp in milliseconds.
    pub created_at: i64,
    /// Unix epoch timestamp in milliseconds.
    pub updated_at: i64,
}

impl Agent {
    pub fn from_row(row: &Row) -> anyhow::Result<Self> {
        Ok(Self {
            id: row.get("id"),
            organization_id: row.get("organization_id"),
            name: row.get("name"),
            image: row.get("image"),
            resources: row.get("resources"),
            retry_policy: row.get("retry_policy"),
            environment: row.get("environment"),
            use_agent_sandbox: row.get("use_agent_sandbox"),
            warm_pool_size: row.get("warm_pool_size"),
            network_policy: row.get("network_policy"),
            status: row.get::<_, String>("status").parse()?,
            config_hash: row.get("config_hash"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    /// The registration push sent to relayers for this agent.
    pub fn registration_message(&self) -> QueueMessage {
        QueueMessage::Registration {
            agent_id: self.id,
            agent_name: self.name.clone(),
            image: self.image.clone(),
            resources_json: self.resources.to_string(),
            retry_policy_json: self.retry_policy.to_string(),
            environment_json: self.environment.to_string(),
            use_agent_sandbox: self.use_agent_sandbox,
            warm_pool_size: self.warm_pool_size,
            network_policy: self.network_policy.clone(),
            config_hash: self.config_hash.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Execution {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub agent_id: Uuid,
    pub cluster_id: Option<Uuid>,
    pub status: ExecutionStatus,
    pub input: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
    pub attempt: i32,
    /// Unix epoch timestamp in milliseconds.
    pub created_at: i64,
    /// Unix epoch timestamp in milliseconds.
    pub queued_at: Option<i64>,
    /// Unix epoch timestamp in milliseconds.
    pub started_at: Option<i64>,
    /// Unix epoch timestamp in milliseconds.
    pub completed_at: Option<i64>,
}

impl Execution {
    pub fn from_row(row: &Row) -> anyhow::Result<Self> {
        Ok(Self {
            id: row.get("id"),
            organization_id: row.get("organization_id"),
            agent_id: row.get("agent_id"),
            cluster_id: row.get("cluster_id"),
            status: row.get::<_, String>("status").parse()?,
            input: row.get("input"),
            result: row.get("result"),
            error: row.get("error"),
            duration_ms: row.get("duration_ms"),
            attempt: row.get("attempt"),
            created_at: row.get("created_at"),
            queued_at: row.get("queued_at"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_wire_and_rank() {
        assert_eq!(Priority::High.wire(), 1);
        assert_eq!(Priority::Normal.wire(), 2);
        assert_eq!(Priority::Low.wire(), 3);
        assert!(Priority::High.rank() < Priority::Normal.rank());
        assert!(Priority::Normal.rank() < Priority::Low.rank());
    }

    #[test]
    fn priority_parse() {
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert_eq!("normal".parse::<Priority>().unwrap(), Priority::Normal);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn queue_message_roundtrips_as_json() {
        let msg = QueueMessage::Work {
            execution_id: Uuid::new_v4(),
            agent_name: "summarize".into(),
            input_json: r#"{"text":"hi"}"#.into(),
            priority: Priority::High,
        };
        let encoded = serde_json::to_vec(&msg).unwrap();
        let decoded: QueueMessage = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn terminal_statuses() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
    }
}
