//! Applications: one source, one destination, one sync policy.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::kinds::KindRef;

/// Label stamped on every resource an application manages; observation and pruning select on it.
pub const TRACKING_LABEL: &str = "app.keel.io/instance";

/// A managed application. Identity is `name`, unique within the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub name: String,
    pub source: Source,
    pub destination: Destination,
    #[serde(default)]
    pub sync_policy: SyncPolicy,
    /// Kinds observed on the live side in addition to the kinds present in desired state.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tracked_kinds: Vec<KindRef>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Where desired state comes from: a repository location, a revision, the base layer path and
/// the overlay sequence applied on top of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub location: String,
    #[serde(default = "default_revision")]
    pub revision: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overlays: Vec<String>,
}

fn default_revision() -> String { "HEAD".to_string() }

/// Target cluster endpoint and namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    pub endpoint: String,
    pub namespace: String,
}

/// When and how aggressively to reconcile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPolicy {
    #[serde(default)]
    pub automated: bool,
    /// Delete live resources absent from desired state. Off unless asked for.
    #[serde(default)]
    pub prune: bool,
    #[serde(default)]
    pub self_heal: bool,
    /// Consecutive failed observation attempts tolerated before the application is `Error`.
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    #[serde(default = "default_backoff_base", with = "duration")]
    pub backoff_base: Duration,
    #[serde(default = "default_backoff_cap", with = "duration")]
    pub backoff_cap: Duration,
    /// A locked application rejects manual sync requests.
    #[serde(default)]
    pub locked: bool,
}

fn default_retry_limit() -> u32 { 3 }
fn default_backoff_base() -> Duration { Duration::from_secs(5) }
fn default_backoff_cap() -> Duration { Duration::from_secs(300) }

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            automated: false,
            prune: false,
            self_heal: false,
            retry_limit: default_retry_limit(),
            backoff_base: default_backoff_base(),
            backoff_cap: default_backoff_cap(),
            locked: false,
        }
    }
}

/// Durations written as `250ms`, `5s`, `2m`, `1h`, or a bare number of seconds.
pub mod duration {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn parse(s: &str) -> Option<Duration> {
        let s = s.trim();
        let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        let (num, unit) = s.split_at(split);
        let n: u64 = num.parse().ok()?;
        match unit.trim() {
            "ms" => Some(Duration::from_millis(n)),
            "" | "s" => Some(Duration::from_secs(n)),
            "m" => Some(Duration::from_secs(n * 60)),
            "h" => Some(Duration::from_secs(n * 3600)),
            _ => None,
        }
    }

    pub fn render(d: &Duration) -> String {
        let ms = d.as_millis();
        if ms % 1000 != 0 { format!("{}ms", ms) }
        else if ms % 3_600_000 == 0 && ms > 0 { format!("{}h", ms / 3_600_000) }
        else if ms % 60_000 == 0 && ms > 0 { format!("{}m", ms / 60_000) }
        else { format!("{}s", ms / 1000) }
    }

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> { s.serialize_str(&render(d)) }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw { Secs(u64), Text(String) }
        match Raw::deserialize(d)? {
            Raw::Secs(n) => Ok(Duration::from_secs(n)),
            Raw::Text(t) => parse(&t).ok_or_else(|| de::Error::custom(format!("invalid duration: {}", t))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_defaults_are_safe() {
        let p: SyncPolicy = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(!p.automated);
        assert!(!p.prune);
        assert!(!p.self_heal);
        assert_eq!(p.retry_limit, 3);
        assert_eq!(p.backoff_base, Duration::from_secs(5));
    }

    #[test]
    fn durations_parse_and_render() {
        let p: SyncPolicy = serde_json::from_value(serde_json::json!({ "backoffBase": "250ms", "backoffCap": 120 })).unwrap();
        assert_eq!(p.backoff_base, Duration::from_millis(250));
        assert_eq!(p.backoff_cap, Duration::from_secs(120));
        assert_eq!(duration::render(&Duration::from_secs(120)), "2m");
        assert_eq!(duration::parse("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(duration::parse("5 parsecs"), None);
    }
}
