//! Authentication and authorisation seam
//!
//! Credential issuance and role mapping live outside the core; the hub
//! only consumes this trait. The shipped [`StaticAuthority`] reads a TOML
//! table of agent records and operator tokens, which covers single-tenant
//! deployments and every test.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use fh_core::config::load_config;
use fh_core::error::ConfigError;
use fh_core::{AgentId, AgentRecord, OperatorId};

/// Validates agent credentials and operator tokens
#[async_trait]
pub trait AuthAuthority: Send + Sync {
    /// Check an agent's `(agent_id, secret)` pair from its hello frame
    async fn verify_agent(&self, agent_id: &AgentId, secret: &str) -> bool;

    /// Resolve an operator token into an operator identity
    async fn verify_operator(&self, token: &str) -> Option<OperatorId>;

    /// Whether the operator owns the agent (per the agent record)
    async fn operator_owns(&self, operator_id: &OperatorId, agent_id: &AgentId) -> bool;

    /// Record a successful connect on the agent's durable record
    async fn record_connected(&self, agent_id: &AgentId, now: i64);
}

/// On-disk shape of the static credentials table
#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialsFile {
    #[serde(default)]
    agents: Vec<AgentRecord>,
    #[serde(default)]
    operators: Vec<OperatorToken>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OperatorToken {
    token: String,
    operator_id: String,
}

/// Table-backed [`AuthAuthority`]
pub struct StaticAuthority {
    records: RwLock<HashMap<AgentId, AgentRecord>>,
    tokens: HashMap<String, OperatorId>,
}

impl StaticAuthority {
    /// Empty authority; every handshake is rejected
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            tokens: HashMap::new(),
        }
    }

    /// Load the credentials table from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file: CredentialsFile = load_config(path)?;
        Ok(Self::from_parts(file.agents, file.operators))
    }

    /// Build an authority from in-memory records (tests, embedding)
    pub fn with_records(
        agents: Vec<AgentRecord>,
        operators: Vec<(String, OperatorId)>,
    ) -> Self {
        let tokens = operators.into_iter().collect();
        Self {
            records: RwLock::new(
                agents
                    .into_iter()
                    .map(|r| (r.agent_id.clone(), r))
                    .collect(),
            ),
            tokens,
        }
    }

    fn from_parts(agents: Vec<AgentRecord>, operators: Vec<OperatorToken>) -> Self {
        Self::with_records(
            agents,
            operators
                .into_iter()
                .map(|t| (t.token, OperatorId::new(t.operator_id)))
                .collect(),
        )
    }

    /// Number of registered agents
    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    /// Whether no agents are registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for StaticAuthority {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthAuthority for StaticAuthority {
    async fn verify_agent(&self, agent_id: &AgentId, secret: &str) -> bool {
        let records = self.records.read().unwrap();
        match records.get(agent_id) {
            Some(record) => !record.secret.is_empty() && record.secret == secret,
            None => false,
        }
    }

    async fn verify_operator(&self, token: &str) -> Option<OperatorId> {
        self.tokens.get(token).cloned()
    }

    async fn operator_owns(&self, operator_id: &OperatorId, agent_id: &AgentId) -> bool {
        let records = self.records.read().unwrap();
        records
            .get(agent_id)
            .map(|r| r.owner_id == *operator_id)
            .unwrap_or(false)
    }

    async fn record_connected(&self, agent_id: &AgentId, now: i64) {
        let mut records = self.records.write().unwrap();
        if let Some(record) = records.get_mut(agent_id) {
            record.last_connected_at = now;
        }
    }
}
