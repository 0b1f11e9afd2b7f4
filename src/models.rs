use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    #[default]
    Agent,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "agent" => Ok(Role::Agent),
            other => Err(format!("Invalid role: {}", other)),
        }
    }
}

/// An account. Every active account receives leads, whatever its role.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub mobile: String,
    pub password_hash: String,
    pub is_active: bool,
    #[serde(default)]
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    /// Eligible for round-robin assignment. Role does not matter.
    pub fn in_rotation(&self) -> bool {
        self.is_active
    }
}

/// Client-facing agent, without the password hash.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentView {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub mobile: String,
    pub is_active: bool,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Agent> for AgentView {
    fn from(a: &Agent) -> Self {
        AgentView {
            id: a.id,
            name: a.name.clone(),
            email: a.email.clone(),
            mobile: a.mobile.clone(),
            is_active: a.is_active,
            role: a.role,
            created_at: a.created_at,
            updated_at: a.updated_at,
        }
    }
}

/// The `{ id, name, email }` triple joined into lead listings and reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentRef {
    pub id: Uuid,
    pub name: String,
    pub email: String,
}

impl From<&Agent> for AgentRef {
    fn from(a: &Agent) -> Self {
        AgentRef {
            id: a.id,
            name: a.name.clone(),
            email: a.email.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LeadStatus {
    #[default]
    Pending,
    Contacted,
    Converted,
    Rejected,
}

impl FromStr for LeadStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(LeadStatus::Pending),
            "contacted" => Ok(LeadStatus::Contacted),
            "converted" => Ok(LeadStatus::Converted),
            "rejected" => Ok(LeadStatus::Rejected),
            _ => Err(()),
        }
    }
}

impl fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LeadStatus::Pending => "pending",
            LeadStatus::Contacted => "contacted",
            LeadStatus::Converted => "converted",
            LeadStatus::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Tag shared by every lead created from one upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(String);

impl BatchId {
    pub fn from_millis(ms: i64) -> Self {
        BatchId(ms.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized, validated row, not yet assigned or stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadDraft {
    pub first_name: String,
    pub phone: String,
    pub notes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lead {
    pub id: Uuid,
    pub first_name: String,
    pub phone: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub status: LeadStatus,
    pub upload_batch: BatchId,
    /// Owning agent. Not checked against the agent collection after insert.
    pub agent: Uuid,
    /// Store insertion order; breaks ties between leads of one batch.
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lead as returned to clients, with the owning agent joined in.
/// `agent` is `None` when the agent has since been deleted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadView {
    pub id: Uuid,
    pub first_name: String,
    pub phone: String,
    pub notes: String,
    pub status: LeadStatus,
    pub upload_batch: BatchId,
    pub agent: Option<AgentRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LeadView {
    pub fn new(lead: &Lead, agent: Option<AgentRef>) -> Self {
        LeadView {
            id: lead.id,
            first_name: lead.first_name.clone(),
            phone: lead.phone.clone(),
            notes: lead.notes.clone(),
            status: lead.status,
            upload_batch: lead.upload_batch.clone(),
            agent,
            created_at: lead.created_at,
            updated_at: lead.updated_at,
        }
    }
}
