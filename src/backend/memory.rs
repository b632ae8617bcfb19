//! In-memory backend
//!
//! Behaves like a kernel mechanism from the Manager's point of view but keeps
//! state only in its tracker. Used on hosts without iptables/nftables and in
//! tests, where [`FaultInjector`] can make individual operations fail the way
//! a real tool would.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

use super::{Backend, RuleTracker, log_prefix};
use crate::core::error::{Error, Result};
use crate::core::rule::Rule;

#[derive(Debug, Default)]
struct Faults {
    add: HashSet<String>,
    delete: HashSet<String>,
    flush: bool,
}

/// Shared switchboard for simulated kernel failures
#[derive(Debug, Clone, Default)]
pub struct FaultInjector {
    inner: Arc<Mutex<Faults>>,
}

impl FaultInjector {
    fn with<T>(&self, f: impl FnOnce(&mut Faults) -> T) -> T {
        let mut faults = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut faults)
    }

    /// Makes every add of `id` fail.
    pub fn fail_add(&self, id: &str) {
        self.with(|f| f.add.insert(id.to_string()));
    }

    /// Makes the kernel side of deleting `id` fail.
    pub fn fail_delete(&self, id: &str) {
        self.with(|f| f.delete.insert(id.to_string()));
    }

    pub fn fail_flush(&self, fail: bool) {
        self.with(|f| f.flush = fail);
    }

    pub fn clear(&self) {
        self.with(|f| *f = Faults::default());
    }
}

fn simulated(message: String) -> Error {
    Error::Command {
        tool: "memory",
        message,
        stderr: None,
        exit_code: Some(1),
    }
}

/// Backend without kernel effect
#[derive(Debug, Default)]
pub struct MemoryBackend {
    tracker: RuleTracker,
    log_group: Option<u16>,
    faults: FaultInjector,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for making later operations fail.
    pub fn faults(&self) -> FaultInjector {
        self.faults.clone()
    }

    pub fn log_group(&self) -> Option<u16> {
        self.log_group
    }

    fn check_add(&self, rule: &Rule) -> Result<()> {
        if self.faults.with(|f| f.add.contains(&rule.id)) {
            return Err(simulated(format!("cannot add rule '{}'", rule.id)));
        }
        if let Some(group) = self.log_group {
            debug!(
                "memory: {} logs to group {group} with prefix {}",
                rule.id,
                log_prefix(rule.direction, rule.action)
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn list_rules(&self) -> Vec<Rule> {
        self.tracker.rules()
    }

    fn is_tracked(&self, id: &str) -> bool {
        self.tracker.contains(id)
    }

    async fn add_rule(&mut self, rule: &Rule) -> Result<()> {
        self.check_add(rule)?;
        if self.tracker.get(&rule.id).is_none_or(|t| t.rule != *rule) {
            // A replaced rule lands at the end, like a kernel append
            self.tracker.remove(&rule.id);
            self.tracker.insert(rule.clone(), ());
        }
        Ok(())
    }

    async fn insert_rule(&mut self, rule: &Rule) -> Result<()> {
        self.check_add(rule)?;
        self.tracker.insert_first(rule.clone(), ());
        Ok(())
    }

    async fn delete_rule(&mut self, id: &str) -> Result<()> {
        if self.tracker.remove(id).is_none() {
            return Ok(());
        }
        if self.faults.with(|f| f.delete.contains(id)) {
            return Err(simulated(format!("no such rule '{id}'")));
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.faults.with(|f| f.flush) {
            return Err(simulated("flush refused".to_string()));
        }
        self.tracker.clear();
        Ok(())
    }

    async fn setup_logging(&mut self, group: u16) -> Result<()> {
        self.log_group = Some(group);
        Ok(())
    }
}
