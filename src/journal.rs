use anyhow::Context;
use crossbeam_channel::Receiver;
use git2::{Repository, Signature};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

pub const AGENTS_DIR: &str = "agents";
pub const LEADS_DIR: &str = "leads";

const MAX_ENTRIES_PER_COMMIT: usize = 1024;

#[derive(Debug)]
pub enum Change {
    /// Write content to a file, path relative to the repo root.
    Write { path: String, content: String },
    Remove { path: String },
}

/// One logical store mutation. All of its changes land in the same commit.
#[derive(Debug)]
pub struct JournalEntry {
    pub changes: Vec<Change>,
    pub message: String,
}

pub fn agent_path(id: &uuid::Uuid) -> String {
    format!("{}/{}.json", AGENTS_DIR, id)
}

pub fn lead_path(id: &uuid::Uuid) -> String {
    format!("{}/{}.json", LEADS_DIR, id)
}

/// Owns the git repository. Runs on a dedicated OS thread since git2 is sync.
pub struct Journal {
    repo_root: PathBuf,
    receiver: Receiver<JournalEntry>,
}

impl Journal {
    pub fn new(repo_root: PathBuf, receiver: Receiver<JournalEntry>) -> Self {
        Self {
            repo_root,
            receiver,
        }
    }

    /// Block on the first entry, drain whatever else is pending, commit once.
    /// Returns when every sender has been dropped.
    pub fn run(self) {
        tracing::info!("Journal writer started for {:?}", self.repo_root);

        let repo = match ensure_repo(&self.repo_root) {
            Ok(r) => r,
            Err(e) => {
                tracing::error!("Failed to open journal repo: {:?}", e);
                return;
            }
        };

        let mut batch: Vec<JournalEntry> = Vec::with_capacity(64);
        loop {
            let first = match self.receiver.recv() {
                Ok(entry) => entry,
                Err(_) => {
                    tracing::info!("Journal writer shutting down (channel closed)");
                    break;
                }
            };

            batch.clear();
            batch.push(first);
            while batch.len() < MAX_ENTRIES_PER_COMMIT {
                match self.receiver.try_recv() {
                    Ok(entry) => batch.push(entry),
                    Err(_) => break,
                }
            }

            if let Err(e) = self.commit_batch(&repo, &batch) {
                tracing::error!("Journal commit failed ({} entries): {:?}", batch.len(), e);
            }
        }
    }

    fn commit_batch(&self, repo: &Repository, batch: &[JournalEntry]) -> anyhow::Result<()> {
        let mut index = repo.index()?;

        for entry in batch {
            for change in &entry.changes {
                match change {
                    Change::Write { path, content } => {
                        let full_path = self.repo_root.join(path);
                        if let Some(parent) = full_path.parent() {
                            std::fs::create_dir_all(parent)?;
                        }
                        std::fs::write(&full_path, content)
                            .with_context(|| format!("writing {}", path))?;
                        index.add_path(Path::new(path))?;
                    }
                    Change::Remove { path } => {
                        match std::fs::remove_file(self.repo_root.join(path)) {
                            Ok(()) => {}
                            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                            Err(e) => return Err(e).with_context(|| format!("removing {}", path)),
                        }
                        // Not tracked yet if it was written and removed in one batch.
                        let _ = index.remove_path(Path::new(path));
                    }
                }
            }
        }
        index.write()?;

        let oid = index.write_tree()?;
        let tree = repo.find_tree(oid)?;
        let sig = Signature::now("leadhub", "leadhub@localhost")?;

        let parent_commit = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(_) => None, // Initial commit
        };
        let parents = match &parent_commit {
            Some(c) => vec![c],
            None => vec![],
        };

        let message = commit_message(batch);
        repo.commit(Some("HEAD"), &sig, &sig, &message, &tree, &parents)?;

        tracing::debug!("journal committed {} entries", batch.len());
        Ok(())
    }
}

fn commit_message(batch: &[JournalEntry]) -> String {
    match batch {
        [single] => single.message.clone(),
        _ => {
            let mut msg = format!("{} store mutations\n", batch.len());
            for entry in batch {
                msg.push('\n');
                msg.push_str(&entry.message);
            }
            msg
        }
    }
}

pub fn ensure_repo(repo_root: &Path) -> anyhow::Result<Repository> {
    if repo_root.join(".git").exists() {
        Repository::open(repo_root).context("Failed to open existing journal repo")
    } else {
        std::fs::create_dir_all(repo_root)?;
        Repository::init(repo_root).context("Failed to init journal repo")
    }
}

/// Read every `*.json` document under `repo_root/dir`.
pub fn load_documents<T: DeserializeOwned>(repo_root: &Path, dir: &str) -> anyhow::Result<Vec<T>> {
    let dir_path = repo_root.join(dir);
    if !dir_path.exists() {
        return Ok(Vec::new());
    }

    let mut docs = Vec::new();
    for entry in std::fs::read_dir(&dir_path)
        .with_context(|| format!("reading {}", dir_path.display()))?
    {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let doc = serde_json::from_str(&raw)
            .with_context(|| format!("decoding {}", path.display()))?;
        docs.push(doc);
    }
    Ok(docs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    fn run_entries(root: &Path, entries: Vec<JournalEntry>) {
        let (tx, rx) = bounded(16);
        for e in entries {
            tx.send(e).unwrap();
        }
        drop(tx);
        Journal::new(root.to_path_buf(), rx).run();
    }

    #[test]
    fn writes_documents_and_commits_them() {
        let dir = TempDir::new().unwrap();
        run_entries(
            dir.path(),
            vec![JournalEntry {
                changes: vec![Change::Write {
                    path: "agents/a.json".into(),
                    content: json!({ "name": "X" }).to_string(),
                }],
                message: "Create agent X".into(),
            }],
        );

        let docs: Vec<Value> = load_documents(dir.path(), AGENTS_DIR).unwrap();
        assert_eq!(docs, vec![json!({ "name": "X" })]);

        let repo = Repository::open(dir.path()).unwrap();
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        assert_eq!(head.message(), Some("Create agent X"));
    }

    #[test]
    fn remove_deletes_the_document() {
        let dir = TempDir::new().unwrap();
        run_entries(
            dir.path(),
            vec![
                JournalEntry {
                    changes: vec![Change::Write {
                        path: "leads/l.json".into(),
                        content: "{}".into(),
                    }],
                    message: "insert".into(),
                },
                JournalEntry {
                    changes: vec![Change::Remove {
                        path: "leads/l.json".into(),
                    }],
                    message: "remove".into(),
                },
            ],
        );

        let docs: Vec<Value> = load_documents(dir.path(), LEADS_DIR).unwrap();
        assert!(docs.is_empty());
    }

    #[test]
    fn missing_collection_loads_empty() {
        let dir = TempDir::new().unwrap();
        let docs: Vec<Value> = load_documents(dir.path(), LEADS_DIR).unwrap();
        assert!(docs.is_empty());
    }

    #[test]
    fn drained_batch_message_lists_every_entry() {
        let batch = vec![
            JournalEntry { changes: vec![], message: "one".into() },
            JournalEntry { changes: vec![], message: "two".into() },
        ];
        let msg = commit_message(&batch);
        assert!(msg.starts_with("2 store mutations"));
        assert!(msg.contains("one") && msg.contains("two"));
    }
}
