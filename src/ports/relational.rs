//! Relational store port: typed repositories over the node's durable state.
//!
//! Components call repository methods with primitive keys and get plain
//! data records back; joins and pooling are the adapter's business. The
//! request path groups its writes (chat row + mastery delta) into one
//! transaction via [`RelationalTx`] so a failed request leaves no rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PortError;
use crate::vkp::VkpInstallation;

/// Directory entry for a student.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

/// Directory entry for a subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectRecord {
    pub subject_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Persisted copy of a completed question and answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRecord {
    pub chat_id: Uuid,
    pub user_id: String,
    pub subject_id: String,
    pub question: String,
    pub response: String,
    pub confidence: f32,
    pub created_at: DateTime<Utc>,
}

/// Per-(user, subject, topic) mastery state. Unique on the triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasteryRecord {
    pub user_id: String,
    pub subject_id: String,
    pub topic: String,
    /// Estimated competence in [0, 1].
    pub mastery_level: f32,
    pub question_count: u32,
    pub correct_count: u32,
    pub last_interaction: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Derived view of a struggling topic; rebuildable from mastery + chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeakArea {
    pub user_id: String,
    pub subject_id: String,
    pub topic: String,
    /// Weakness score in [0, 1]; higher means weaker.
    pub score: f32,
    pub detected_at: DateTime<Utc>,
}

/// Practice difficulty band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

/// Pre-seeded practice item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PracticeQuestion {
    pub question_id: String,
    pub subject_id: String,
    pub topic: String,
    pub question: String,
    pub answer: String,
    pub difficulty: Difficulty,
}

/// Typed repository access to durable node state.
#[async_trait]
pub trait RelationalStorePort: Send + Sync {
    /// Open a write transaction for the request path.
    async fn begin(&self) -> Result<Box<dyn RelationalTx>, PortError>;

    // ── Directories ──────────────────────────────────────────────

    async fn upsert_user(&self, user: &UserRecord) -> Result<(), PortError>;
    async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, PortError>;
    async fn list_users(&self) -> Result<Vec<UserRecord>, PortError>;
    async fn upsert_subject(&self, subject: &SubjectRecord) -> Result<(), PortError>;
    async fn get_subject(&self, subject_id: &str) -> Result<Option<SubjectRecord>, PortError>;
    async fn list_subjects(&self) -> Result<Vec<SubjectRecord>, PortError>;

    // ── Chat history ─────────────────────────────────────────────

    /// Chats created at or after `since`, oldest first; all when `None`.
    async fn list_chats_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ChatRecord>, PortError>;
    async fn chat_count(&self) -> Result<usize, PortError>;

    // ── Mastery & weak areas ─────────────────────────────────────

    async fn get_mastery(
        &self,
        user_id: &str,
        subject_id: &str,
        topic: &str,
    ) -> Result<Option<MasteryRecord>, PortError>;
    async fn list_mastery(
        &self,
        user_id: &str,
        subject_id: &str,
    ) -> Result<Vec<MasteryRecord>, PortError>;
    async fn list_weak_areas(
        &self,
        user_id: &str,
        subject_id: &str,
    ) -> Result<Vec<WeakArea>, PortError>;

    // ── Practice bank ────────────────────────────────────────────

    async fn put_practice_questions(&self, items: &[PracticeQuestion]) -> Result<(), PortError>;
    async fn list_practice_questions(
        &self,
        subject_id: &str,
    ) -> Result<Vec<PracticeQuestion>, PortError>;

    // ── Package installations ────────────────────────────────────

    async fn put_installation(&self, installation: &VkpInstallation) -> Result<(), PortError>;
    async fn get_installation(
        &self,
        subject: &str,
        grade: &str,
    ) -> Result<Option<VkpInstallation>, PortError>;
    async fn list_installations(&self) -> Result<Vec<VkpInstallation>, PortError>;

    async fn health(&self) -> Result<(), PortError>;
}

/// A staged write set: nothing is visible until `commit`.
///
/// Staging methods are infallible buffering; all failure happens at
/// commit, atomically from the reader's point of view.
#[async_trait]
pub trait RelationalTx: Send {
    fn insert_chat(&mut self, record: ChatRecord);
    fn upsert_mastery(&mut self, record: MasteryRecord);
    fn upsert_weak_area(&mut self, area: WeakArea);
    fn remove_weak_area(&mut self, user_id: &str, subject_id: &str, topic: &str);

    /// Apply the staged writes.
    async fn commit(self: Box<Self>) -> Result<(), PortError>;

    /// Discard the staged writes. Dropping without commit is equivalent.
    async fn rollback(self: Box<Self>) -> Result<(), PortError>;
}
