use crate::config::Config;
use crate::journal::{self, Change, Journal, JournalEntry};
use crate::models::{Agent, BatchId, Lead, LeadDraft, LeadStatus, Role};
use anyhow::Context;
use chrono::Utc;
use crossbeam_channel::{bounded, Sender as CbSender, TrySendError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::cmp::Reverse;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use uuid::Uuid;

const JOURNAL_CAPACITY: usize = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Agent with this email already exists")]
    DuplicateEmail,
    #[error("Agent not found")]
    AgentNotFound,
    #[error("Lead not found")]
    LeadNotFound,
    #[error("journal unavailable: {0}")]
    Journal(&'static str),
    #[error("failed to encode document: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Fields for a new account. The password is already hashed.
#[derive(Debug, Clone)]
pub struct NewAgent {
    pub name: String,
    pub email: String,
    pub mobile: String,
    pub password_hash: String,
    pub role: Role,
}

/// Partial overwrite; `None` leaves the field alone.
#[derive(Debug, Clone, Default)]
pub struct AgentUpdate {
    pub name: Option<String>,
    pub email: Option<String>,
    pub mobile: Option<String>,
    pub is_active: Option<bool>,
}

// ── Core State ───────────────────────────────────────────────────────────────
// Agents and leads live in DashMaps; that is the store requests read and write.
// Every mutation is first handed to the journal writer (crossbeam channel →
// git repo on disk) and only applied in memory once the hand-off succeeded.
// On startup the maps are rebuilt from the journal's working tree.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    agents: Arc<DashMap<Uuid, Agent>>,
    emails: Arc<DashMap<String, Uuid>>, // normalized email → agent id
    leads: Arc<DashMap<Uuid, Lead>>,
    lead_seq: Arc<AtomicU64>,
    last_batch_ms: Arc<AtomicI64>,
    journal_tx: CbSender<JournalEntry>,
    journal_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl AppState {
    pub fn open(config: Config) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.upload_dir).context("Failed to create upload directory")?;
        journal::ensure_repo(&config.data_dir)?;

        let agents = DashMap::new();
        let emails = DashMap::new();
        for agent in journal::load_documents::<Agent>(&config.data_dir, journal::AGENTS_DIR)? {
            if emails.insert(agent.email.clone(), agent.id).is_some() {
                tracing::warn!("duplicate email {} in journal, keeping the last", agent.email);
            }
            agents.insert(agent.id, agent);
        }

        let leads = DashMap::new();
        let mut next_seq = 0u64;
        for lead in journal::load_documents::<Lead>(&config.data_dir, journal::LEADS_DIR)? {
            next_seq = next_seq.max(lead.seq + 1);
            leads.insert(lead.id, lead);
        }

        let (journal_tx, journal_rx) = bounded::<JournalEntry>(JOURNAL_CAPACITY);
        let writer = Journal::new(config.data_dir.clone(), journal_rx);
        let journal_handle = std::thread::Builder::new()
            .name("journal-writer".into())
            .spawn(move || writer.run())
            .context("Failed to spawn journal writer thread")?;

        tracing::info!(
            "Store opened: {} agents, {} leads from {:?}",
            agents.len(),
            leads.len(),
            config.data_dir
        );

        Ok(AppState {
            config: Arc::new(config),
            agents: Arc::new(agents),
            emails: Arc::new(emails),
            leads: Arc::new(leads),
            lead_seq: Arc::new(AtomicU64::new(next_seq)),
            last_batch_ms: Arc::new(AtomicI64::new(0)),
            journal_tx,
            journal_handle: Arc::new(Mutex::new(Some(journal_handle))),
        })
    }

    /// Close the journal channel and wait for pending commits.
    /// Blocks until every other clone of the state has been dropped.
    pub fn shutdown(self) {
        let handle = self.journal_handle.clone();
        drop(self);

        let mut guard = handle.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(h) = guard.take() {
            if let Err(e) = h.join() {
                tracing::error!("Journal writer thread panicked: {:?}", e);
            }
        }
    }

    fn journal(&self, entry: JournalEntry) -> Result<(), StoreError> {
        self.journal_tx.try_send(entry).map_err(|e| match e {
            TrySendError::Full(_) => StoreError::Journal("queue full"),
            TrySendError::Disconnected(_) => StoreError::Journal("writer stopped"),
        })
    }

    // ── Agents ───────────────────────────────────────────────────────────────

    pub fn create_agent(&self, new: NewAgent) -> Result<Agent, StoreError> {
        let email = normalize_email(&new.email);
        let id = Uuid::new_v4();

        // Claim the email first so two concurrent creates cannot both win.
        match self.emails.entry(email.clone()) {
            Entry::Occupied(_) => return Err(StoreError::DuplicateEmail),
            Entry::Vacant(vac) => {
                vac.insert(id);
            }
        }

        let now = Utc::now();
        let agent = Agent {
            id,
            name: new.name.trim().to_string(),
            email: email.clone(),
            mobile: new.mobile.trim().to_string(),
            password_hash: new.password_hash,
            is_active: true,
            role: new.role,
            created_at: now,
            updated_at: now,
        };

        let written = serde_json::to_string_pretty(&agent)
            .map_err(StoreError::from)
            .and_then(|content| {
                self.journal(JournalEntry {
                    changes: vec![Change::Write {
                        path: journal::agent_path(&id),
                        content,
                    }],
                    message: format!("Create agent {}", agent.email),
                })
            });
        if let Err(e) = written {
            self.emails.remove(&email);
            return Err(e);
        }

        self.agents.insert(id, agent.clone());
        Ok(agent)
    }

    pub fn agent(&self, id: &Uuid) -> Option<Agent> {
        self.agents.get(id).map(|a| a.clone())
    }

    pub fn agent_by_email(&self, email: &str) -> Option<Agent> {
        let id = *self.emails.get(&normalize_email(email))?;
        self.agent(&id)
    }

    /// All accounts ordered by `(created_at, id)`.
    pub fn list_agents(&self) -> Vec<Agent> {
        let mut all: Vec<Agent> = self.agents.iter().map(|a| a.clone()).collect();
        all.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        all
    }

    /// The round-robin pool: every active account, admins included, oldest first.
    pub fn active_agents(&self) -> Vec<Agent> {
        let mut pool: Vec<Agent> = self
            .agents
            .iter()
            .filter(|a| a.in_rotation())
            .map(|a| a.clone())
            .collect();
        pool.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        pool
    }

    pub fn update_agent(&self, id: &Uuid, update: AgentUpdate) -> Result<Agent, StoreError> {
        let current = self.agent(id).ok_or(StoreError::AgentNotFound)?;

        let new_email = update
            .email
            .as_deref()
            .map(normalize_email)
            .filter(|e| !e.is_empty() && *e != current.email);

        if let Some(email) = &new_email {
            match self.emails.entry(email.clone()) {
                Entry::Occupied(occ) if *occ.get() != *id => return Err(StoreError::DuplicateEmail),
                Entry::Occupied(_) => {}
                Entry::Vacant(vac) => {
                    vac.insert(*id);
                }
            }
        }
        let release_claim = |email: &Option<String>| {
            if let Some(e) = email {
                self.emails.remove_if(e, |_, owner| owner == id);
            }
        };

        let mut guard = match self.agents.get_mut(id) {
            Some(g) => g,
            None => {
                // Deleted while we were claiming the email.
                release_claim(&new_email);
                return Err(StoreError::AgentNotFound);
            }
        };

        let mut updated = guard.clone();
        if let Some(name) = update.name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()) {
            updated.name = name;
        }
        if let Some(mobile) = update.mobile.map(|m| m.trim().to_string()).filter(|m| !m.is_empty()) {
            updated.mobile = mobile;
        }
        if let Some(email) = &new_email {
            updated.email = email.clone();
        }
        if let Some(active) = update.is_active {
            updated.is_active = active;
        }
        updated.updated_at = Utc::now();

        let written = serde_json::to_string_pretty(&updated)
            .map_err(StoreError::from)
            .and_then(|content| {
                self.journal(JournalEntry {
                    changes: vec![Change::Write {
                        path: journal::agent_path(id),
                        content,
                    }],
                    message: format!("Update agent {}", updated.email),
                })
            });
        if let Err(e) = written {
            drop(guard);
            release_claim(&new_email);
            return Err(e);
        }

        let old_email = std::mem::take(&mut guard.email);
        *guard = updated.clone();
        drop(guard);

        if new_email.is_some() {
            self.emails.remove_if(&old_email, |_, owner| owner == id);
        }
        Ok(updated)
    }

    /// Hard delete. Leads owned by the agent are left in place; returns how many.
    pub fn delete_agent(&self, id: &Uuid) -> Result<usize, StoreError> {
        let agent = self.agent(id).ok_or(StoreError::AgentNotFound)?;

        self.journal(JournalEntry {
            changes: vec![Change::Remove {
                path: journal::agent_path(id),
            }],
            message: format!("Delete agent {}", agent.email),
        })?;

        self.agents.remove(id);
        self.emails.remove_if(&agent.email, |_, owner| owner == id);

        let orphaned = self.leads.iter().filter(|l| l.agent == *id).count();
        if orphaned > 0 {
            tracing::warn!(
                "Deleted agent {} still owns {} leads; they keep the dangling reference",
                id,
                orphaned
            );
        }
        Ok(orphaned)
    }

    // ── Leads ────────────────────────────────────────────────────────────────

    /// Millisecond timestamp, bumped past the previous one if the clock has
    /// not moved, so every upload gets its own tag.
    pub fn next_batch_id(&self) -> BatchId {
        let now = Utc::now().timestamp_millis();
        let prev = self
            .last_batch_ms
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last + 1)))
            .unwrap_or(now - 1);
        BatchId::from_millis(now.max(prev + 1))
    }

    /// Bulk insert of one upload. All leads are journaled in a single entry;
    /// if that hand-off fails nothing is inserted.
    pub fn insert_batch(
        &self,
        batch: &BatchId,
        assigned: Vec<(LeadDraft, Uuid)>,
    ) -> Result<Vec<Lead>, StoreError> {
        let now = Utc::now();
        let base = self.lead_seq.fetch_add(assigned.len() as u64, Ordering::SeqCst);

        let leads: Vec<Lead> = assigned
            .into_iter()
            .enumerate()
            .map(|(i, (draft, agent))| Lead {
                id: Uuid::new_v4(),
                first_name: draft.first_name,
                phone: draft.phone,
                notes: draft.notes,
                status: LeadStatus::Pending,
                upload_batch: batch.clone(),
                agent,
                seq: base + i as u64,
                created_at: now,
                updated_at: now,
            })
            .collect();

        let mut changes = Vec::with_capacity(leads.len());
        for lead in &leads {
            changes.push(Change::Write {
                path: journal::lead_path(&lead.id),
                content: serde_json::to_string_pretty(lead)?,
            });
        }
        self.journal(JournalEntry {
            changes,
            message: format!("Upload batch {}: {} leads", batch, leads.len()),
        })?;

        for lead in &leads {
            self.leads.insert(lead.id, lead.clone());
        }
        Ok(leads)
    }

    /// Newest first. `agent = None` means every agent. `page` is 1-based.
    pub fn leads_page(&self, agent: Option<Uuid>, page: usize, limit: usize) -> (Vec<Lead>, usize) {
        let mut matching: Vec<Lead> = self
            .leads
            .iter()
            .filter(|l| agent.map_or(true, |a| l.agent == a))
            .map(|l| l.clone())
            .collect();
        let total = matching.len();

        matching.sort_by_key(|l| Reverse((l.created_at, l.seq)));
        let skip = page.saturating_sub(1).saturating_mul(limit);
        let page_items = matching.into_iter().skip(skip).take(limit).collect();
        (page_items, total)
    }

    pub fn update_lead_status(&self, id: &Uuid, status: LeadStatus) -> Result<Lead, StoreError> {
        let mut guard = self.leads.get_mut(id).ok_or(StoreError::LeadNotFound)?;

        let mut updated = guard.clone();
        updated.status = status;
        updated.updated_at = Utc::now();

        self.journal(JournalEntry {
            changes: vec![Change::Write {
                path: journal::lead_path(id),
                content: serde_json::to_string_pretty(&updated)?,
            }],
            message: format!("Set lead {} status to {}", id, status),
        })?;

        *guard = updated.clone();
        Ok(updated)
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Helper: a store backed by temp directories.
    pub(crate) fn test_state() -> (AppState, TempDir) {
        let dir = TempDir::new().unwrap();
        let cfg = Config::for_dirs(dir.path().join("data"), dir.path().join("uploads"));
        let state = AppState::open(cfg).unwrap();
        (state, dir)
    }

    impl AppState {
        pub(crate) fn lead(&self, id: &Uuid) -> Option<Lead> {
            self.leads.get(id).map(|l| l.clone())
        }

        /// Leads of one upload in insertion order.
        pub(crate) fn leads_in_batch(&self, batch: &BatchId) -> Vec<Lead> {
            let mut found: Vec<Lead> = self
                .leads
                .iter()
                .filter(|l| l.upload_batch == *batch)
                .map(|l| l.clone())
                .collect();
            found.sort_by_key(|l| l.seq);
            found
        }

        pub(crate) fn lead_count(&self) -> usize {
            self.leads.len()
        }
    }

    pub(crate) fn new_agent(name: &str, email: &str) -> NewAgent {
        NewAgent {
            name: name.to_string(),
            email: email.to_string(),
            mobile: "+15550000".to_string(),
            password_hash: "hash".to_string(),
            role: Role::Agent,
        }
    }

    fn draft(name: &str) -> LeadDraft {
        LeadDraft {
            first_name: name.to_string(),
            phone: "555".to_string(),
            notes: String::new(),
        }
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected_case_insensitively() {
        let (state, _dir) = test_state();
        state.create_agent(new_agent("X", "x@example.com")).unwrap();
        let err = state
            .create_agent(new_agent("X2", "  X@Example.com "))
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateEmail));
        assert_eq!(state.list_agents().len(), 1);
    }

    #[tokio::test]
    async fn active_pool_includes_admins_excludes_inactive_and_is_ordered() {
        let (state, _dir) = test_state();
        let a = state.create_agent(new_agent("A", "a@example.com")).unwrap();
        let b = state.create_agent(new_agent("B", "b@example.com")).unwrap();
        let c = state.create_agent(new_agent("C", "c@example.com")).unwrap();
        let mut admin = new_agent("Root", "root@example.com");
        admin.role = Role::Admin;
        let root = state.create_agent(admin).unwrap();

        state
            .update_agent(&b.id, AgentUpdate { is_active: Some(false), ..Default::default() })
            .unwrap();

        let pool: Vec<Uuid> = state.active_agents().iter().map(|a| a.id).collect();
        assert_eq!(pool, vec![a.id, c.id, root.id]);
    }

    #[tokio::test]
    async fn update_is_partial_and_moves_email_index() {
        let (state, _dir) = test_state();
        let a = state.create_agent(new_agent("A", "a@example.com")).unwrap();

        let updated = state
            .update_agent(
                &a.id,
                AgentUpdate {
                    email: Some("new@example.com".into()),
                    name: Some(String::new()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.name, "A", "empty name is ignored");
        assert_eq!(updated.mobile, a.mobile);
        assert!(state.agent_by_email("a@example.com").is_none());
        assert_eq!(state.agent_by_email("new@example.com").unwrap().id, a.id);
    }

    #[tokio::test]
    async fn update_to_taken_email_is_rejected() {
        let (state, _dir) = test_state();
        let a = state.create_agent(new_agent("A", "a@example.com")).unwrap();
        state.create_agent(new_agent("B", "b@example.com")).unwrap();
        let err = state
            .update_agent(&a.id, AgentUpdate { email: Some("b@example.com".into()), ..Default::default() })
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateEmail));
        assert_eq!(state.agent(&a.id).unwrap().email, "a@example.com");
    }

    #[tokio::test]
    async fn delete_leaves_leads_dangling() {
        let (state, _dir) = test_state();
        let a = state.create_agent(new_agent("A", "a@example.com")).unwrap();
        let batch = state.next_batch_id();
        state
            .insert_batch(&batch, vec![(draft("L1"), a.id), (draft("L2"), a.id)])
            .unwrap();

        let orphaned = state.delete_agent(&a.id).unwrap();
        assert_eq!(orphaned, 2);
        assert!(state.agent(&a.id).is_none());
        assert_eq!(state.lead_count(), 2);
        assert!(matches!(state.delete_agent(&a.id), Err(StoreError::AgentNotFound)));
        // The email is free again.
        state.create_agent(new_agent("A2", "a@example.com")).unwrap();
    }

    #[tokio::test]
    async fn batch_ids_are_unique_and_increasing() {
        let (state, _dir) = test_state();
        let ids: Vec<i64> = (0..50)
            .map(|_| state.next_batch_id().as_str().parse().unwrap())
            .collect();
        for pair in ids.windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }

    #[tokio::test]
    async fn leads_page_is_newest_first_and_paginated() {
        let (state, _dir) = test_state();
        let a = state.create_agent(new_agent("A", "a@example.com")).unwrap();
        let b = state.create_agent(new_agent("B", "b@example.com")).unwrap();

        let first = state.next_batch_id();
        state
            .insert_batch(&first, vec![(draft("old1"), a.id), (draft("old2"), b.id)])
            .unwrap();
        let second = state.next_batch_id();
        state
            .insert_batch(&second, vec![(draft("new1"), a.id), (draft("new2"), b.id)])
            .unwrap();

        let (page1, total) = state.leads_page(None, 1, 3);
        assert_eq!(total, 4);
        let names: Vec<&str> = page1.iter().map(|l| l.first_name.as_str()).collect();
        assert_eq!(names, vec!["new2", "new1", "old2"]);

        let (page2, _) = state.leads_page(None, 2, 3);
        assert_eq!(page2.len(), 1);
        assert_eq!(page2[0].first_name, "old1");

        let (only_a, total_a) = state.leads_page(Some(a.id), 1, 50);
        assert_eq!(total_a, 2);
        assert!(only_a.iter().all(|l| l.agent == a.id));
    }

    #[tokio::test]
    async fn status_update_persists_in_store() {
        let (state, _dir) = test_state();
        let a = state.create_agent(new_agent("A", "a@example.com")).unwrap();
        let batch = state.next_batch_id();
        let saved = state.insert_batch(&batch, vec![(draft("L"), a.id)]).unwrap();

        let updated = state
            .update_lead_status(&saved[0].id, LeadStatus::Contacted)
            .unwrap();
        assert_eq!(updated.status, LeadStatus::Contacted);
        assert_eq!(state.lead(&saved[0].id).unwrap().status, LeadStatus::Contacted);

        let missing = state.update_lead_status(&Uuid::new_v4(), LeadStatus::Converted);
        assert!(matches!(missing, Err(StoreError::LeadNotFound)));
    }

    #[tokio::test]
    async fn reopen_restores_agents_and_leads_from_journal() {
        let dir = TempDir::new().unwrap();
        let cfg = Config::for_dirs(dir.path().join("data"), dir.path().join("uploads"));

        let state = AppState::open(cfg.clone()).unwrap();
        let a = state.create_agent(new_agent("A", "a@example.com")).unwrap();
        let batch = state.next_batch_id();
        let saved = state
            .insert_batch(&batch, vec![(draft("L1"), a.id), (draft("L2"), a.id)])
            .unwrap();
        state
            .update_lead_status(&saved[1].id, LeadStatus::Rejected)
            .unwrap();
        state.shutdown();

        let reopened = AppState::open(cfg).unwrap();
        assert_eq!(reopened.agent_by_email("a@example.com").unwrap().id, a.id);
        let restored = reopened.leads_in_batch(&batch);
        assert_eq!(restored.len(), 2);
        assert_eq!(restored[0].first_name, "L1");
        assert_eq!(restored[1].status, LeadStatus::Rejected);

        // Sequence numbers continue after the restored ones.
        let next = reopened.next_batch_id();
        let more = reopened.insert_batch(&next, vec![(draft("L3"), a.id)]).unwrap();
        assert!(more[0].seq > restored[1].seq);
    }
}
