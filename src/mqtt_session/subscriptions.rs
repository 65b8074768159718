// SPDX-License-Identifier: MPL-2.0

use std::collections::BTreeMap;

/// Returns true when `topic` is matched by `filter` (MQTT 3.1.1, 4.7).
///
/// `+` matches exactly one level and `#` matches the parent level and everything below it.
/// Filters starting with a wildcard never match topics starting with `$`.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic == filter {
        return true;
    }

    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    if filter == "#" {
        return true;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            // "a/#" also matches "a"
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Active subscriptions of a session: topic filter to granted QoS.
#[derive(Debug, Default, Clone)]
pub struct SubscriptionTable {
    entries: BTreeMap<String, u8>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a granted subscription, replacing a previous grant for the same filter.
    pub fn insert(&mut self, filter: impl Into<String>, granted_qos: u8) -> Option<u8> {
        self.entries.insert(filter.into(), granted_qos)
    }

    pub fn remove(&mut self, filter: &str) -> Option<u8> {
        self.entries.remove(filter)
    }

    pub fn get(&self, filter: &str) -> Option<u8> {
        self.entries.get(filter).copied()
    }

    pub fn contains(&self, filter: &str) -> bool {
        self.entries.contains_key(filter)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u8)> {
        self.entries.iter().map(|(f, q)| (f.as_str(), *q))
    }

    /// Filters matching an inbound topic, in lexical order.
    pub fn matching<'a>(&'a self, topic: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .keys()
            .map(String::as_str)
            .filter(move |f| topic_matches_filter(topic, f))
    }

    /// Empties the table and returns the filters it held.
    pub fn drain(&mut self) -> Vec<String> {
        std::mem::take(&mut self.entries).into_keys().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_and_single_level() {
        assert!(topic_matches_filter("a/b", "a/b"));
        assert!(topic_matches_filter("a/b/c", "a/+/c"));
        assert!(topic_matches_filter("a//c", "a/+/c"));
        assert!(!topic_matches_filter("a/b/c/d", "a/+/c"));
        assert!(!topic_matches_filter("a/b", "a/b/c"));
        assert!(topic_matches_filter("sport/tennis", "+/+"));
        assert!(!topic_matches_filter("sport", "+/+"));
    }

    #[test]
    fn test_multi_level() {
        assert!(topic_matches_filter("a/b/c", "a/#"));
        assert!(topic_matches_filter("a", "a/#"));
        assert!(topic_matches_filter("anything/at/all", "#"));
        assert!(!topic_matches_filter("b/c", "a/#"));
    }

    #[test]
    fn test_dollar_topics() {
        assert!(!topic_matches_filter("$SYS/uptime", "#"));
        assert!(!topic_matches_filter("$SYS/uptime", "+/uptime"));
        assert!(topic_matches_filter("$SYS/uptime", "$SYS/#"));
    }

    #[test]
    fn test_table() {
        let mut table = SubscriptionTable::new();
        table.insert("a/b", 1);
        table.insert("a/#", 0);
        table.insert("c", 2);
        assert_eq!(table.insert("c", 1), Some(2));
        assert_eq!(table.len(), 3);

        let matched: Vec<&str> = table.matching("a/b").collect();
        assert_eq!(matched, vec!["a/#", "a/b"]);

        assert_eq!(table.remove("a/#"), Some(0));
        assert!(!table.contains("a/#"));

        let drained = table.drain();
        assert_eq!(drained, vec!["a/b".to_string(), "c".to_string()]);
        assert!(table.is_empty());
    }
}
