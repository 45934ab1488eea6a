//! Mastery tracking over answered questions.
//!
//! Every persisted answer feeds a per-(user, subject, topic) mastery
//! record; the update is staged into the same transaction as the chat
//! row, so a failed request moves no pedagogy state. Weak areas are a
//! derived view with hysteresis so topics don't flap across the
//! threshold.

mod practice;

pub use practice::difficulty_for;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::error::PortError;
use crate::ports::{MasteryRecord, RandomPort, RelationalStorePort, RelationalTx, WeakArea};

/// Exposure can lift the mastery floor this high on its own.
const EXPOSURE_FLOOR_MAX: f32 = 0.35;
/// Question count at which the exposure floor saturates.
const FLOOR_SATURATION_COUNT: f32 = 20.0;
/// Idle days tolerated before decay starts.
const DECAY_GRACE_DAYS: i64 = 7;
/// Mastery lost per idle day past the grace period.
const DECAY_PER_DAY: f32 = 0.01;

/// Thresholds for weak-area detection and practice selection.
#[derive(Debug, Clone)]
pub struct PedagogyConfig {
    /// A topic becomes weak below this mastery level.
    pub weak_enter: f32,
    /// A weak topic exits only above this level (hysteresis).
    pub weak_exit: f32,
    /// Question count that, combined with fresh activity, flags a topic.
    pub burst_count: u32,
    /// How recent the previous interaction must be to count as a burst.
    pub burst_fresh: Duration,
}

impl Default for PedagogyConfig {
    fn default() -> Self {
        Self {
            weak_enter: 0.40,
            weak_exit: 0.50,
            burst_count: 8,
            burst_fresh: Duration::hours(24),
        }
    }
}

/// Deterministic mastery estimate.
///
/// The baseline is the correct/total ratio. Exposure raises a floor
/// logarithmically in question count (more practice means the estimate
/// never sits at zero), and idle time past a grace period decays the
/// result linearly. Clamped to [0, 1]; pinned by tests.
pub fn mastery_level(question_count: u32, correct_count: u32, idle: Duration) -> f32 {
    let ratio = if question_count > 0 {
        correct_count as f32 / question_count as f32
    } else {
        0.0
    };
    let floor = EXPOSURE_FLOOR_MAX
        * ((1.0 + question_count as f32).ln() / (1.0 + FLOOR_SATURATION_COUNT).ln()).min(1.0);
    let idle_days = idle.num_days();
    let decay = if idle_days > DECAY_GRACE_DAYS {
        DECAY_PER_DAY * (idle_days - DECAY_GRACE_DAYS) as f32
    } else {
        0.0
    };
    (ratio.max(floor) - decay).clamp(0.0, 1.0)
}

/// Observes answers, maintains mastery and weak areas, selects practice.
pub struct MasteryTracker {
    relational: Arc<dyn RelationalStorePort>,
    random: Arc<dyn RandomPort>,
    config: PedagogyConfig,
}

impl MasteryTracker {
    pub fn new(
        relational: Arc<dyn RelationalStorePort>,
        random: Arc<dyn RandomPort>,
        config: PedagogyConfig,
    ) -> Self {
        Self {
            relational,
            random,
            config,
        }
    }

    pub(crate) fn relational(&self) -> &Arc<dyn RelationalStorePort> {
        &self.relational
    }

    pub(crate) fn random(&self) -> &Arc<dyn RandomPort> {
        &self.random
    }

    /// Fold one answered question into the user's mastery state.
    ///
    /// Stages the mastery upsert and any weak-area change into `tx`;
    /// nothing is visible until the caller commits. `correct` is the
    /// external grading signal; without one the correct count stays
    /// where it is.
    pub async fn observe_answer(
        &self,
        tx: &mut dyn RelationalTx,
        user_id: &str,
        subject_id: &str,
        topic: &str,
        correct: Option<bool>,
        now: DateTime<Utc>,
    ) -> Result<MasteryRecord, PortError> {
        let existing = self
            .relational
            .get_mastery(user_id, subject_id, topic)
            .await?;

        let (question_count, correct_count, created_at, idle) = match &existing {
            Some(prev) => (
                prev.question_count + 1,
                prev.correct_count + u32::from(correct == Some(true)),
                prev.created_at,
                now - prev.last_interaction,
            ),
            None => (1, u32::from(correct == Some(true)), now, Duration::zero()),
        };

        let level = mastery_level(question_count, correct_count, idle);
        let record = MasteryRecord {
            user_id: user_id.to_string(),
            subject_id: subject_id.to_string(),
            topic: topic.to_string(),
            mastery_level: level,
            question_count,
            correct_count,
            last_interaction: now,
            created_at,
        };
        tx.upsert_mastery(record.clone());

        let fresh_burst = question_count >= self.config.burst_count
            && existing
                .as_ref()
                .map(|prev| now - prev.last_interaction <= self.config.burst_fresh)
                .unwrap_or(false);

        if level < self.config.weak_enter || fresh_burst {
            tx.upsert_weak_area(WeakArea {
                user_id: user_id.to_string(),
                subject_id: subject_id.to_string(),
                topic: topic.to_string(),
                score: (1.0 - level).clamp(0.0, 1.0),
                detected_at: now,
            });
        } else if level > self.config.weak_exit {
            tx.remove_weak_area(user_id, subject_id, topic);
        }
        // Between enter and exit: hysteresis, leave the record alone.

        Ok(record)
    }

    /// Mastery rows for a (user, subject), sorted by topic.
    pub async fn mastery_for(
        &self,
        user_id: &str,
        subject_id: &str,
    ) -> Result<Vec<MasteryRecord>, PortError> {
        let mut rows = self.relational.list_mastery(user_id, subject_id).await?;
        rows.sort_by(|a, b| a.topic.cmp(&b.topic));
        Ok(rows)
    }

    /// Weak areas for a (user, subject), weakest first.
    pub async fn weak_areas_for(
        &self,
        user_id: &str,
        subject_id: &str,
    ) -> Result<Vec<WeakArea>, PortError> {
        let mut rows = self.relational.list_weak_areas(user_id, subject_id).await?;
        rows.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.topic.cmp(&b.topic))
        });
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::SledStore;
    use crate::ports::SeededRandom;

    fn assert_close(actual: f32, expected: f32) {
        assert!(
            (actual - expected).abs() < 1e-4,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn mastery_function_is_pinned() {
        // One unanswered question: pure exposure floor.
        assert_close(
            mastery_level(1, 0, Duration::zero()),
            0.35 * (2.0f32.ln() / 21.0f32.ln()),
        );
        // Saturation: floor tops out at 0.35.
        assert_close(mastery_level(20, 0, Duration::zero()), 0.35);
        assert_close(mastery_level(500, 0, Duration::zero()), 0.35);
        // Perfect record dominates the floor.
        assert_close(mastery_level(4, 4, Duration::zero()), 1.0);
        // Decay starts after the grace week.
        assert_close(mastery_level(4, 4, Duration::days(7)), 1.0);
        assert_close(mastery_level(4, 4, Duration::days(10)), 0.97);
    }

    #[test]
    fn mastery_is_monotone_in_exposure_and_clamped() {
        let mut last = 0.0;
        for q in 1..50 {
            let level = mastery_level(q, 0, Duration::zero());
            assert!(level >= last);
            assert!((0.0..=1.0).contains(&level));
            last = level;
        }
        // Heavy decay never goes below zero.
        assert_close(mastery_level(1, 0, Duration::days(400)), 0.0);
    }

    fn tracker() -> (MasteryTracker, Arc<SledStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SledStore::open(dir.path().join("db")).unwrap());
        let tracker = MasteryTracker::new(
            store.clone(),
            Arc::new(SeededRandom::new(7)),
            PedagogyConfig::default(),
        );
        (tracker, store, dir)
    }

    #[tokio::test]
    async fn first_answer_creates_weak_area() {
        let (tracker, store, _dir) = tracker();
        let now = "2026-03-01T09:00:00Z".parse().unwrap();

        let mut tx = store.begin().await.unwrap();
        let record = tracker
            .observe_answer(tx.as_mut(), "u1", "math", "fractions", None, now)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(record.question_count, 1);
        assert_eq!(record.correct_count, 0);
        assert!(record.mastery_level < 0.40);
        let weak = tracker.weak_areas_for("u1", "math").await.unwrap();
        assert_eq!(weak.len(), 1);
        assert_eq!(weak[0].topic, "fractions");
    }

    #[tokio::test]
    async fn weak_area_exits_with_hysteresis() {
        let (tracker, store, _dir) = tracker();
        let mut now: DateTime<Utc> = "2026-03-01T09:00:00Z".parse().unwrap();

        let observe = |correct: Option<bool>, at: DateTime<Utc>| {
            let tracker = &tracker;
            let store = &store;
            async move {
                let mut tx = store.begin().await.unwrap();
                let rec = tracker
                    .observe_answer(tx.as_mut(), "u1", "math", "fractions", correct, at)
                    .await
                    .unwrap();
                tx.commit().await.unwrap();
                rec
            }
        };

        // Ungraded first question: low mastery, topic flagged weak.
        let rec = observe(None, now).await;
        assert!(rec.mastery_level < 0.40);
        assert_eq!(tracker.weak_areas_for("u1", "math").await.unwrap().len(), 1);

        // One correct answer lands exactly at 0.5: inside the hysteresis
        // band, so the flag stays.
        now += Duration::minutes(5);
        let rec = observe(Some(true), now).await;
        assert_close(rec.mastery_level, 0.5);
        assert_eq!(tracker.weak_areas_for("u1", "math").await.unwrap().len(), 1);

        // A second correct answer clears the exit threshold.
        now += Duration::minutes(5);
        let rec = observe(Some(true), now).await;
        assert!(rec.mastery_level > 0.50);
        assert!(tracker.weak_areas_for("u1", "math").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rapid_fire_questions_flag_a_burst() {
        let (tracker, store, _dir) = tracker();
        let mut now: DateTime<Utc> = "2026-03-01T09:00:00Z".parse().unwrap();

        // Eight correct answers in one sitting: mastery is high, but the
        // burst heuristic still flags the topic.
        for _ in 0..8 {
            let mut tx = store.begin().await.unwrap();
            tracker
                .observe_answer(tx.as_mut(), "u1", "math", "geometry", Some(true), now)
                .await
                .unwrap();
            tx.commit().await.unwrap();
            now += Duration::minutes(2);
        }

        let weak = tracker.weak_areas_for("u1", "math").await.unwrap();
        assert_eq!(weak.len(), 1);
        assert_eq!(weak[0].topic, "geometry");
    }
}
