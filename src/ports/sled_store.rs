//! Sled-backed relational store adapter.
//!
//! One tree per table, JSON values, composite keys joined with the unit
//! separator. Chat keys are prefixed with a fixed-width RFC 3339
//! timestamp so lexicographic range scans are chronological scans.
//!
//! Commits are serialized by a process-wide lock and applied as one
//! batch; readers only ever observe committed rows. This adapter trades
//! multi-writer throughput for simplicity, which fits a single-node
//! deployment with W inference workers.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::PortError;
use crate::ports::relational::{
    ChatRecord, MasteryRecord, PracticeQuestion, RelationalStorePort, RelationalTx, SubjectRecord,
    UserRecord, WeakArea,
};
use crate::vkp::VkpInstallation;

/// Separator for composite keys; never appears in well-formed ids.
const SEP: char = '\u{1f}';

fn mastery_key(user_id: &str, subject_id: &str, topic: &str) -> String {
    format!("{user_id}{SEP}{subject_id}{SEP}{topic}")
}

fn chat_key(record: &ChatRecord) -> String {
    // Micros + Z keeps the timestamp fixed-width, so byte order is time order.
    let stamp = record
        .created_at
        .to_rfc3339_opts(SecondsFormat::Micros, true);
    format!("{stamp}|{}", record.chat_id)
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, PortError> {
    serde_json::from_slice(bytes).map_err(|e| PortError::Storage(format!("corrupt row: {e}")))
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, PortError> {
    serde_json::to_vec(value).map_err(|e| PortError::Serialization(e.to_string()))
}

#[derive(Clone)]
struct Trees {
    users: sled::Tree,
    subjects: sled::Tree,
    chats: sled::Tree,
    mastery: sled::Tree,
    weak_areas: sled::Tree,
    practice: sled::Tree,
    installs: sled::Tree,
}

/// Durable node state in a local sled database.
pub struct SledStore {
    db: sled::Db,
    trees: Trees,
    commit_lock: Arc<Mutex<()>>,
}

impl SledStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PortError> {
        let db = sled::open(path)?;
        let trees = Trees {
            users: db.open_tree("users")?,
            subjects: db.open_tree("subjects")?,
            chats: db.open_tree("chat_history")?,
            mastery: db.open_tree("topic_mastery")?,
            weak_areas: db.open_tree("weak_areas")?,
            practice: db.open_tree("practice_questions")?,
            installs: db.open_tree("vkp_installations")?,
        };
        Ok(Self {
            db,
            trees,
            commit_lock: Arc::new(Mutex::new(())),
        })
    }

    fn scan_all<T: serde::de::DeserializeOwned>(tree: &sled::Tree) -> Result<Vec<T>, PortError> {
        let mut out = Vec::new();
        for row in tree.iter() {
            let (_, value) = row?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }
}

#[async_trait]
impl RelationalStorePort for SledStore {
    async fn begin(&self) -> Result<Box<dyn RelationalTx>, PortError> {
        Ok(Box::new(SledTx {
            trees: self.trees.clone(),
            commit_lock: Arc::clone(&self.commit_lock),
            ops: Vec::new(),
        }))
    }

    async fn upsert_user(&self, user: &UserRecord) -> Result<(), PortError> {
        self.trees.users.insert(user.user_id.as_bytes(), encode(user)?)?;
        Ok(())
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, PortError> {
        match self.trees.users.get(user_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn list_users(&self) -> Result<Vec<UserRecord>, PortError> {
        Self::scan_all(&self.trees.users)
    }

    async fn upsert_subject(&self, subject: &SubjectRecord) -> Result<(), PortError> {
        self.trees
            .subjects
            .insert(subject.subject_id.as_bytes(), encode(subject)?)?;
        Ok(())
    }

    async fn get_subject(&self, subject_id: &str) -> Result<Option<SubjectRecord>, PortError> {
        match self.trees.subjects.get(subject_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn list_subjects(&self) -> Result<Vec<SubjectRecord>, PortError> {
        Self::scan_all(&self.trees.subjects)
    }

    async fn list_chats_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ChatRecord>, PortError> {
        let mut out = Vec::new();
        match since {
            Some(since) => {
                let start = since.to_rfc3339_opts(SecondsFormat::Micros, true);
                for row in self.trees.chats.range(start.into_bytes()..) {
                    let (_, value) = row?;
                    out.push(decode(&value)?);
                }
            }
            None => {
                for row in self.trees.chats.iter() {
                    let (_, value) = row?;
                    out.push(decode(&value)?);
                }
            }
        }
        Ok(out)
    }

    async fn chat_count(&self) -> Result<usize, PortError> {
        Ok(self.trees.chats.len())
    }

    async fn get_mastery(
        &self,
        user_id: &str,
        subject_id: &str,
        topic: &str,
    ) -> Result<Option<MasteryRecord>, PortError> {
        let key = mastery_key(user_id, subject_id, topic);
        match self.trees.mastery.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn list_mastery(
        &self,
        user_id: &str,
        subject_id: &str,
    ) -> Result<Vec<MasteryRecord>, PortError> {
        let prefix = format!("{user_id}{SEP}{subject_id}{SEP}");
        let mut out = Vec::new();
        for row in self.trees.mastery.scan_prefix(prefix.as_bytes()) {
            let (_, value) = row?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    async fn list_weak_areas(
        &self,
        user_id: &str,
        subject_id: &str,
    ) -> Result<Vec<WeakArea>, PortError> {
        let prefix = format!("{user_id}{SEP}{subject_id}{SEP}");
        let mut out = Vec::new();
        for row in self.trees.weak_areas.scan_prefix(prefix.as_bytes()) {
            let (_, value) = row?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    async fn put_practice_questions(&self, items: &[PracticeQuestion]) -> Result<(), PortError> {
        for item in items {
            let key = format!("{}{SEP}{}", item.subject_id, item.question_id);
            self.trees.practice.insert(key.as_bytes(), encode(item)?)?;
        }
        Ok(())
    }

    async fn list_practice_questions(
        &self,
        subject_id: &str,
    ) -> Result<Vec<PracticeQuestion>, PortError> {
        let prefix = format!("{subject_id}{SEP}");
        let mut out = Vec::new();
        for row in self.trees.practice.scan_prefix(prefix.as_bytes()) {
            let (_, value) = row?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    async fn put_installation(&self, installation: &VkpInstallation) -> Result<(), PortError> {
        let key = format!("{}{SEP}{}", installation.subject, installation.grade);
        self.trees
            .installs
            .insert(key.as_bytes(), encode(installation)?)?;
        Ok(())
    }

    async fn get_installation(
        &self,
        subject: &str,
        grade: &str,
    ) -> Result<Option<VkpInstallation>, PortError> {
        let key = format!("{subject}{SEP}{grade}");
        match self.trees.installs.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn list_installations(&self) -> Result<Vec<VkpInstallation>, PortError> {
        Self::scan_all(&self.trees.installs)
    }

    async fn health(&self) -> Result<(), PortError> {
        self.db.size_on_disk()?;
        Ok(())
    }
}

enum StagedOp {
    InsertChat(ChatRecord),
    UpsertMastery(MasteryRecord),
    UpsertWeakArea(WeakArea),
    RemoveWeakArea { key: String },
}

/// Staged write set against a [`SledStore`].
struct SledTx {
    trees: Trees,
    commit_lock: Arc<Mutex<()>>,
    ops: Vec<StagedOp>,
}

#[async_trait]
impl RelationalTx for SledTx {
    fn insert_chat(&mut self, record: ChatRecord) {
        self.ops.push(StagedOp::InsertChat(record));
    }

    fn upsert_mastery(&mut self, record: MasteryRecord) {
        self.ops.push(StagedOp::UpsertMastery(record));
    }

    fn upsert_weak_area(&mut self, area: WeakArea) {
        self.ops.push(StagedOp::UpsertWeakArea(area));
    }

    fn remove_weak_area(&mut self, user_id: &str, subject_id: &str, topic: &str) {
        self.ops.push(StagedOp::RemoveWeakArea {
            key: mastery_key(user_id, subject_id, topic),
        });
    }

    async fn commit(self: Box<Self>) -> Result<(), PortError> {
        // Encode before taking the lock so the critical section is writes only.
        let mut writes: Vec<(sled::Tree, String, Option<Vec<u8>>)> =
            Vec::with_capacity(self.ops.len());
        for op in &self.ops {
            match op {
                StagedOp::InsertChat(rec) => {
                    writes.push((self.trees.chats.clone(), chat_key(rec), Some(encode(rec)?)));
                }
                StagedOp::UpsertMastery(rec) => {
                    let key = mastery_key(&rec.user_id, &rec.subject_id, &rec.topic);
                    writes.push((self.trees.mastery.clone(), key, Some(encode(rec)?)));
                }
                StagedOp::UpsertWeakArea(area) => {
                    let key = mastery_key(&area.user_id, &area.subject_id, &area.topic);
                    writes.push((self.trees.weak_areas.clone(), key, Some(encode(area)?)));
                }
                StagedOp::RemoveWeakArea { key } => {
                    writes.push((self.trees.weak_areas.clone(), key.clone(), None));
                }
            }
        }

        let _guard = self.commit_lock.lock().unwrap_or_else(|e| e.into_inner());
        for (tree, key, value) in writes {
            match value {
                Some(bytes) => {
                    tree.insert(key.as_bytes(), bytes)?;
                }
                None => {
                    tree.remove(key.as_bytes())?;
                }
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), PortError> {
        // Staged ops are dropped with self.
        Ok(())
    }
}
