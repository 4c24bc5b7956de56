//! Access-pattern tracking.
//!
//! For each session we remember the previous range read and count the steps
//! taken from one range shape to the next. A step is relative (row and column
//! offset of the top-left corner plus the new size), so "scroll down by one
//! page" learned on rows 1-100 predicts rows 201-300 after reading 101-200.
//!
//! Weights decay geometrically per elapsed decay interval and are pruned once
//! they fall under the minimum weight.

use std::collections::HashMap;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::config::PrefetchConfig;
use crate::range::CellRange;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RangeShape {
    resource_id: String,
    sheet: Option<String>,
    rows: u32,
    columns: u32,
}

impl RangeShape {
    fn of(resource_id: &str, range: &CellRange) -> Self {
        Self {
            resource_id: resource_id.to_string(),
            sheet: range.sheet.clone(),
            rows: range.rows(),
            columns: range.columns(),
        }
    }
}

/// Movement from one range to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Step {
    pub row_offset: i64,
    pub column_offset: i64,
    pub rows: u32,
    pub columns: u32,
}

impl Step {
    fn between(from: &CellRange, to: &CellRange) -> Self {
        Self {
            row_offset: i64::from(to.start_row) - i64::from(from.start_row),
            column_offset: i64::from(to.start_col) - i64::from(from.start_col),
            rows: to.rows(),
            columns: to.columns(),
        }
    }

    fn apply(&self, from: &CellRange) -> Option<CellRange> {
        from.shifted(self.row_offset, self.column_offset, self.rows, self.columns)
    }

    fn is_stationary(&self) -> bool {
        self.row_offset == 0 && self.column_offset == 0
    }
}

/// A predicted next read.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub range: CellRange,
    pub confidence: f64,
}

struct SessionPattern {
    last: Option<(String, CellRange)>,
    transitions: HashMap<RangeShape, HashMap<Step, f64>>,
    last_decay: Instant,
    last_seen: Instant,
}

impl SessionPattern {
    fn new(now: Instant) -> Self {
        Self {
            last: None,
            transitions: HashMap::new(),
            last_decay: now,
            last_seen: now,
        }
    }

    fn decay(&mut self, now: Instant, config: &PrefetchConfig) {
        let interval = config.decay_interval();
        let periods = (now.saturating_duration_since(self.last_decay).as_secs_f64() / interval.as_secs_f64()).floor();
        if periods < 1.0 {
            return;
        }

        let factor = config.decay_factor.powf(periods);
        for steps in self.transitions.values_mut() {
            for weight in steps.values_mut() {
                *weight *= factor;
            }
            steps.retain(|_, weight| *weight >= config.min_weight);
        }
        self.transitions.retain(|_, steps| !steps.is_empty());
        self.last_decay += interval.mul_f64(periods);
    }
}

pub struct AccessTracker {
    sessions: DashMap<String, SessionPattern>,
    config: PrefetchConfig,
}

impl AccessTracker {
    pub fn new(config: PrefetchConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
        }
    }

    /// Record a read of `range` on `resource_id` by `session_id`.
    pub fn record(&self, session_id: &str, resource_id: &str, range: &CellRange) {
        let now = Instant::now();
        let mut pattern = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionPattern::new(now));

        pattern.decay(now, &self.config);
        pattern.last_seen = now;

        if let Some((last_resource, last_range)) = pattern.last.take() {
            if last_resource == resource_id && last_range.sheet == range.sheet {
                let step = Step::between(&last_range, range);
                if !step.is_stationary() {
                    *pattern
                        .transitions
                        .entry(RangeShape::of(resource_id, &last_range))
                        .or_default()
                        .entry(step)
                        .or_insert(0.0) += 1.0;
                }
            }
        }
        pattern.last = Some((resource_id.to_string(), range.clone()));
    }

    /// Most likely next reads after `range`, strongest first. Only steps
    /// holding at least `threshold` of the shape's weight are returned.
    pub fn predict(
        &self,
        session_id: &str,
        resource_id: &str,
        range: &CellRange,
        top_k: usize,
        threshold: f64,
    ) -> Vec<Prediction> {
        let Some(pattern) = self.sessions.get(session_id) else {
            return Vec::new();
        };
        let Some(steps) = pattern.transitions.get(&RangeShape::of(resource_id, range)) else {
            return Vec::new();
        };

        let total: f64 = steps.values().sum();
        if total <= 0.0 {
            return Vec::new();
        }

        let mut ranked: Vec<(&Step, f64)> = steps.iter().map(|(s, w)| (s, *w / total)).collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        ranked
            .into_iter()
            .take(top_k)
            .filter(|(_, confidence)| *confidence >= threshold)
            .filter_map(|(step, confidence)| {
                step.apply(range).map(|range| Prediction { range, confidence })
            })
            .collect()
    }

    pub fn forget_session(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    /// Drop sessions idle past the configured limit. Returns how many went.
    pub fn expire_idle(&self) -> usize {
        let now = Instant::now();
        let idle = self.config.session_idle();
        let before = self.sessions.len();
        self.sessions
            .retain(|_, pattern| now.saturating_duration_since(pattern.last_seen) <= idle);
        before - self.sessions.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn range(s: &str) -> CellRange {
        CellRange::parse(s).unwrap()
    }

    fn tracker() -> AccessTracker {
        AccessTracker::new(PrefetchConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_scroll_predicts_next_page() {
        let t = tracker();
        t.record("s1", "book", &range("A1:D100"));
        t.record("s1", "book", &range("A101:D200"));
        t.record("s1", "book", &range("A201:D300"));

        let predictions = t.predict("s1", "book", &range("A201:D300"), 2, 0.3);
        assert_eq!(predictions.len(), 1);
        assert_eq!(predictions[0].range.to_string(), "A301:D400");
        assert_eq!(predictions[0].confidence, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessions_and_resources_are_isolated() {
        let t = tracker();
        t.record("s1", "book", &range("A1:D100"));
        t.record("s1", "book", &range("A101:D200"));

        assert!(t.predict("s2", "book", &range("A101:D200"), 2, 0.0).is_empty());
        assert!(t.predict("s1", "other", &range("A101:D200"), 2, 0.0).is_empty());

        // Switching resources does not record a cross-resource step.
        t.record("s1", "other", &range("A1:D100"));
        t.record("s1", "other", &range("A1:D100"));
        assert!(t.predict("s1", "other", &range("A1:D100"), 2, 0.0).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_confidence_steps_are_filtered() {
        let t = tracker();
        // From a 10-row shape: step down three times, step right once.
        for _ in 0..3 {
            t.record("s", "book", &range("A1:B10"));
            t.record("s", "book", &range("A11:B20"));
        }
        t.record("s", "book", &range("A1:B10"));
        t.record("s", "book", &range("C1:D10"));

        let all = t.predict("s", "book", &range("A1:B10"), 5, 0.0);
        assert!(all.len() >= 2);
        assert_eq!(all[0].range.to_string(), "A11:B20");

        let confident = t.predict("s", "book", &range("A1:B10"), 5, 0.3);
        assert!(confident.iter().all(|p| p.confidence >= 0.3));
        assert!(confident.iter().all(|p| p.range.to_string() != "C1:D10"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_decay_prunes_stale_patterns() {
        let t = tracker();
        t.record("s", "book", &range("A1:D100"));
        t.record("s", "book", &range("A101:D200"));
        assert_eq!(t.predict("s", "book", &range("A1:D100"), 1, 0.0).len(), 1);

        // 0.8^14 < 0.05.
        tokio::time::advance(Duration::from_secs(60 * 14)).await;
        t.record("s", "book", &range("Z1:Z2"));
        assert!(t.predict("s", "book", &range("A1:D100"), 1, 0.0).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sessions_expire() {
        let t = tracker();
        t.record("old", "book", &range("A1"));
        tokio::time::advance(Duration::from_secs(1_801)).await;
        t.record("new", "book", &range("A1"));
        assert_eq!(t.expire_idle(), 1);
        assert_eq!(t.session_count(), 1);
    }
}
