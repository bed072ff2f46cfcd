//! Bounded per-job execution history.

use std::collections::VecDeque;

use dashmap::DashMap;

use crate::ExecutionResult;

/// Maximum number of results retained per job.
pub const MAX_RESULTS_PER_JOB: usize = 50;

/// Append-only log of execution results, capped per job.
///
/// When a job's history is full, recording a new result evicts the oldest.
#[derive(Debug)]
pub struct ResultLog {
    entries: DashMap<String, VecDeque<ExecutionResult>>,
    capacity: usize,
}

impl Default for ResultLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultLog {
    pub fn new() -> Self {
        Self::with_capacity(MAX_RESULTS_PER_JOB)
    }

    /// Log that keeps at most `capacity` results per job.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, result: ExecutionResult) {
        let mut history = self.entries.entry(result.job_id.clone()).or_default();
        if history.len() >= self.capacity {
            history.pop_front();
        }
        history.push_back(result);
    }

    /// Up to `limit` results for `job_id`, most recent first. Empty for unknown jobs.
    pub fn history(&self, job_id: &str, limit: Option<usize>) -> Vec<ExecutionResult> {
        let Some(history) = self.entries.get(job_id) else {
            return Vec::new();
        };
        history
            .iter()
            .rev()
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// Drop every result for `job_id`.
    pub fn purge(&self, job_id: &str) {
        self.entries.remove(job_id);
    }

    /// Number of results held for `job_id`.
    pub fn len(&self, job_id: &str) -> usize {
        self.entries.get(job_id).map_or(0, |history| history.len())
    }

    pub fn is_empty(&self, job_id: &str) -> bool {
        self.len(job_id) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ExecutionStatus;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn result(job_id: &str, n: i64) -> ExecutionResult {
        ExecutionResult {
            job_id: job_id.to_string(),
            job_name: job_id.to_string(),
            executed_at: Utc.timestamp_opt(n, 0).unwrap(),
            status: ExecutionStatus::Success,
            result: Some(json!(n)),
            error: None,
            traceback: None,
            duration_ms: 1,
        }
    }

    #[test]
    fn test_history_is_most_recent_first() {
        let log = ResultLog::new();
        for n in 0..3 {
            log.record(result("a", n));
        }
        let seen: Vec<_> = log.history("a", None).into_iter().map(|r| r.result).collect();
        assert_eq!(seen, vec![Some(json!(2)), Some(json!(1)), Some(json!(0))]);

        let latest = log.history("a", Some(1));
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].result, Some(json!(2)));
    }

    #[test]
    fn test_fifty_first_record_evicts_oldest() {
        let log = ResultLog::new();
        for n in 0..=MAX_RESULTS_PER_JOB as i64 {
            log.record(result("a", n));
        }
        let history = log.history("a", None);
        assert_eq!(history.len(), MAX_RESULTS_PER_JOB);
        assert_eq!(history.first().unwrap().result, Some(json!(50)));
        assert_eq!(history.last().unwrap().result, Some(json!(1)));
    }

    #[test]
    fn test_jobs_are_isolated_and_purgeable() {
        let log = ResultLog::with_capacity(2);
        log.record(result("a", 1));
        log.record(result("b", 2));
        log.record(result("b", 3));
        log.record(result("b", 4));

        assert_eq!(log.len("a"), 1);
        assert_eq!(log.len("b"), 2);

        log.purge("b");
        assert!(log.is_empty("b"));
        assert!(log.history("b", None).is_empty());
        assert_eq!(log.len("a"), 1);
        assert!(log.history("missing", None).is_empty());
        assert_eq!(log.history("a", Some(0)).len(), 0);
    }

    proptest::proptest! {
        #[test]
        fn prop_history_keeps_latest_window(count in 0usize..120, capacity in 1usize..60) {
            let log = ResultLog::with_capacity(capacity);
            for n in 0..count {
                log.record(result("a", n as i64));
            }

            let history = log.history("a", None);
            proptest::prop_assert_eq!(history.len(), count.min(capacity));
            let expected: Vec<_> = (count.saturating_sub(capacity)..count)
                .rev()
                .map(|n| Some(json!(n as i64)))
                .collect();
            let seen: Vec<_> = history.into_iter().map(|r| r.result).collect();
            proptest::prop_assert_eq!(seen, expected);
        }
    }
}
