//! Adaptive practice selection from the pre-seeded question bank.
//!
//! Selection is deterministic given the user's mastery state and the
//! node's random seed: the bank is shuffled once with port-supplied
//! values, then stably sorted by weakness and difficulty fit, so equal
//! candidates keep their shuffled order.

use std::collections::HashMap;

use crate::error::PortError;
use crate::pedagogy::MasteryTracker;
use crate::ports::{Difficulty, PracticeQuestion, RandomPort};

/// Map a mastery level to the difficulty band a student should practice.
pub fn difficulty_for(mastery: f32) -> Difficulty {
    if mastery < 0.3 {
        Difficulty::Easy
    } else if mastery < 0.6 {
        Difficulty::Medium
    } else {
        Difficulty::Hard
    }
}

/// In-place Fisher-Yates using the random port.
fn shuffle<T>(items: &mut [T], random: &dyn RandomPort) {
    if items.len() < 2 {
        return;
    }
    for i in (1..items.len()).rev() {
        let j = (random.next_u64() % (i as u64 + 1)) as usize;
        items.swap(i, j);
    }
}

impl MasteryTracker {
    /// Up to `limit` practice items for a (user, subject), biased toward
    /// weak areas and the difficulty band of each topic's mastery.
    pub async fn practice_for(
        &self,
        user_id: &str,
        subject_id: &str,
        limit: usize,
    ) -> Result<Vec<PracticeQuestion>, PortError> {
        let mut bank = self
            .relational()
            .list_practice_questions(subject_id)
            .await?;
        if bank.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let mastery: HashMap<String, f32> = self
            .relational()
            .list_mastery(user_id, subject_id)
            .await?
            .into_iter()
            .map(|r| (r.topic, r.mastery_level))
            .collect();
        let weakness: HashMap<String, f32> = self
            .relational()
            .list_weak_areas(user_id, subject_id)
            .await?
            .into_iter()
            .map(|w| (w.topic, w.score))
            .collect();

        shuffle(&mut bank, self.random().as_ref());
        // Weakest topics first; within a topic, items matching the
        // student's difficulty band before the rest. The sort is stable,
        // so ties keep their shuffled order.
        bank.sort_by(|a, b| {
            let weak_a = weakness.get(&a.topic).copied().unwrap_or(0.0);
            let weak_b = weakness.get(&b.topic).copied().unwrap_or(0.0);
            weak_b
                .partial_cmp(&weak_a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let fit = |q: &PracticeQuestion| {
                        // Unseen topics practice easy.
                        let level = mastery.get(&q.topic).copied().unwrap_or(0.0);
                        q.difficulty != difficulty_for(level)
                    };
                    fit(a).cmp(&fit(b))
                })
        });

        bank.truncate(limit);
        Ok(bank)
    }
}
