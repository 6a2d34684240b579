//! Usage statistics, accumulated per model on every upstream reply.

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;

use chat_protocol::Usage;

#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageStat {
    pub requests: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_tokens: u64,
    pub error_count: u64,
    pub rate_limit_count: u64,
    pub last_updated_ms: i64,
}

#[derive(Debug, Default)]
pub struct StatsRegistry {
    by_model: DashMap<String, UsageStat>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, model: &str, usage: Option<&Usage>) {
        let mut entry = self.by_model.entry(model.to_string()).or_default();
        entry.requests += 1;
        if let Some(u) = usage {
            entry.total_input_tokens += u.prompt_tokens.unwrap_or(0);
            entry.total_output_tokens += u.completion_tokens.unwrap_or(0);
            entry.total_tokens += u.total_tokens.unwrap_or(0);
        }
        entry.last_updated_ms = Utc::now().timestamp_millis();
    }

    pub fn record_rate_limit(&self, model: &str) {
        let mut entry = self.by_model.entry(model.to_string()).or_default();
        entry.requests += 1;
        entry.rate_limit_count += 1;
        entry.last_updated_ms = Utc::now().timestamp_millis();
    }

    pub fn record_error(&self, model: &str) {
        let mut entry = self.by_model.entry(model.to_string()).or_default();
        entry.requests += 1;
        entry.error_count += 1;
        entry.last_updated_ms = Utc::now().timestamp_millis();
    }

    pub fn snapshot(&self) -> std::collections::HashMap<String, UsageStat> {
        self.by_model
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_tokens_across_calls() {
        let stats = StatsRegistry::new();
        stats.record_success(
            "m",
            Some(&Usage {
                prompt_tokens: Some(10),
                completion_tokens: Some(5),
                total_tokens: Some(15),
            }),
        );
        stats.record_success(
            "m",
            Some(&Usage {
                prompt_tokens: Some(3),
                completion_tokens: Some(2),
                total_tokens: Some(5),
            }),
        );
        let snap = stats.snapshot();
        let entry = &snap["m"];
        assert_eq!(entry.requests, 2);
        assert_eq!(entry.total_input_tokens, 13);
        assert_eq!(entry.total_tokens, 20);
    }

    #[test]
    fn rate_limit_and_error_counts_are_independent() {
        let stats = StatsRegistry::new();
        stats.record_rate_limit("m");
        stats.record_error("m");
        let snap = stats.snapshot();
        assert_eq!(snap["m"].rate_limit_count, 1);
        assert_eq!(snap["m"].error_count, 1);
        assert_eq!(snap["m"].requests, 2);
    }
}
