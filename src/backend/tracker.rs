use crate::core::rule::Rule;

/// A rule together with whatever the mechanism needs to find it again
#[derive(Debug, Clone)]
pub struct Tracked<H> {
    pub rule: Rule,
    pub handle: H,
}

/// Insertion-ordered index of installed rules keyed by id
///
/// Rule sets are small, so a vector with linear lookup keeps kernel
/// ordering visible without a second index.
#[derive(Debug, Clone)]
pub struct RuleTracker<H = ()> {
    entries: Vec<Tracked<H>>,
}

impl<H> Default for RuleTracker<H> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<H> RuleTracker<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&Tracked<H>> {
        self.entries.iter().find(|t| t.rule.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Records a rule. An existing entry with the same id is replaced in place.
    pub fn insert(&mut self, rule: Rule, handle: H) {
        if let Some(existing) = self.entries.iter_mut().find(|t| t.rule.id == rule.id) {
            existing.rule = rule;
            existing.handle = handle;
        } else {
            self.entries.push(Tracked { rule, handle });
        }
    }

    /// Records a rule ahead of every other entry, dropping any older entry with the same id.
    pub fn insert_first(&mut self, rule: Rule, handle: H) {
        self.remove(&rule.id);
        self.entries.insert(0, Tracked { rule, handle });
    }

    pub fn remove(&mut self, id: &str) -> Option<Tracked<H>> {
        let pos = self.entries.iter().position(|t| t.rule.id == id)?;
        Some(self.entries.remove(pos))
    }

    pub fn rules(&self) -> Vec<Rule> {
        self.entries.iter().map(|t| t.rule.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tracked<H>> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rule::{Action, Direction, Protocol};

    fn rule(id: &str) -> Rule {
        Rule::new(id, Direction::Inbound, Protocol::Tcp, Action::Accept)
    }

    #[test]
    fn test_insert_keeps_order_and_replaces_in_place() {
        let mut tracker = RuleTracker::<u64>::new();
        tracker.insert(rule("a"), 1);
        tracker.insert(rule("b"), 2);
        tracker.insert(rule("a").with_port(80), 3);

        assert_eq!(tracker.len(), 2);
        let ids: Vec<_> = tracker.rules().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, ["a", "b"]);
        assert_eq!(tracker.get("a").unwrap().handle, 3);
        assert_eq!(tracker.get("a").unwrap().rule.port, 80);
    }

    #[test]
    fn test_insert_first_moves_to_front() {
        let mut tracker = RuleTracker::<u64>::new();
        tracker.insert(rule("a"), 1);
        tracker.insert(rule("b"), 2);
        tracker.insert_first(rule("b").with_port(22), 3);
        tracker.insert_first(rule("c"), 4);

        let ids: Vec<_> = tracker.rules().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, ["c", "b", "a"]);
        assert_eq!(tracker.get("b").unwrap().handle, 3);
    }

    #[test]
    fn test_remove_missing_is_none() {
        let mut tracker = RuleTracker::<()>::new();
        tracker.insert(rule("a"), ());
        assert!(tracker.remove("a").is_some());
        assert!(tracker.remove("a").is_none());
        assert!(tracker.is_empty());
    }
}
