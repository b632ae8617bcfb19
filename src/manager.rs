//! Rule lifecycle manager
//!
//! The [`Manager`] is the only component that touches a [`Backend`]. Every
//! public method takes one exclusive lock for its full duration, backend
//! calls included, so kernel mutations never interleave.
//!
//! Guarantees:
//!
//! - No DROP/REJECT rule covering an immutable port is ever handed to the
//!   backend, on the single-rule and batch paths alike. Block-list entries
//!   are the one exception: they may cover any port because immutable-port
//!   openings sit at the head of the chain, ahead of them.
//! - [`Manager::apply_rules`] is all-or-nothing: on the first kernel failure
//!   every change the batch made is undone before the error is returned.
//! - Deletes are best-effort: the rule is forgotten even when the kernel
//!   delete fails, and the failure is only logged.
//! - Immutable ports are re-opened after every delete, flush and batch.

use ipnetwork::IpNetwork;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::core::error::{Error, Result};
use crate::core::rule::{Action, Direction, ImmutablePort, Protocol, Rule};
use crate::hub::{HubHandle, RuleChange};

/// Rule ids starting with one of these are owned by the manager:
/// immutable-port openings and block-list entries
pub const RESERVED_PREFIXES: [&str; 2] = ["immutable-", "block-"];

const BLOCK_PREFIX: &str = RESERVED_PREFIXES[1];

struct State {
    backend: Box<dyn Backend>,
    immutable: Vec<ImmutablePort>,
}

pub struct Manager {
    state: Mutex<State>,
    backend_name: &'static str,
    events: Option<HubHandle>,
}

/// Refuses a blocking rule that would cut off an immutable port.
///
/// A rule conflicts when its protocol covers the port's protocol and it is
/// either port-less or its range contains the port. Networks do not narrow
/// this: a rule scoped to `0.0.0.0/0` still matches everyone. Direction does
/// not matter either: blocking replies is blocking too.
pub fn check_policy(rule: &Rule, immutable: &[ImmutablePort]) -> Result<()> {
    if !rule.is_blocking() {
        return Ok(());
    }

    let conflict = immutable.iter().find(|p| rule.matches_port(p.port, p.protocol));

    match conflict {
        Some(p) => Err(Error::ImmutablePort {
            rule_id: rule.id.clone(),
            port: p.port,
            protocol: p.protocol,
        }),
        None => Ok(()),
    }
}

fn admit(rule: &Rule, immutable: &[ImmutablePort]) -> Result<()> {
    rule.validate()?;
    if let Some(prefix) = RESERVED_PREFIXES.iter().find(|p| rule.id.starts_with(**p)) {
        return Err(Error::Policy(format!(
            "rule id '{}' uses the reserved prefix '{prefix}'",
            rule.id
        )));
    }
    check_policy(rule, immutable)
}

enum Undo {
    Remove(String),
    Restore(Rule),
}

impl State {
    /// Opens every immutable port, trying all of them before reporting the first failure.
    async fn ensure_immutable(&mut self) -> Result<()> {
        let mut first_error = None;
        for port in &self.immutable {
            if let Err(e) = self.backend.ensure_port(port).await {
                warn!("Could not open immutable port {port}: {e}");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn tracked(&self, id: &str) -> Option<Rule> {
        self.backend.list_rules().into_iter().find(|r| r.id == id)
    }

    async fn rollback(&mut self, undo: Vec<Undo>) {
        for step in undo.into_iter().rev() {
            let result = match &step {
                Undo::Remove(id) => self.backend.delete_rule(id).await,
                Undo::Restore(rule) => self.backend.add_rule(rule).await,
            };
            if let Err(e) = result {
                match step {
                    Undo::Remove(id) => warn!("Rollback: could not remove '{id}': {e}"),
                    Undo::Restore(rule) => warn!("Rollback: could not restore '{}': {e}", rule.id),
                }
            }
        }
    }
}

impl Manager {
    /// Takes ownership of the process-wide backend. Default ports are
    /// always marked permanent.
    pub fn new(backend: Box<dyn Backend>, immutable: Vec<ImmutablePort>) -> Self {
        let mut ports: Vec<ImmutablePort> = Vec::with_capacity(immutable.len());
        for port in immutable {
            if let Some(existing) = ports.iter_mut().find(|p| p.port == port.port && p.protocol == port.protocol) {
                existing.is_default |= port.is_default;
            } else {
                ports.push(port);
            }
        }

        Self {
            backend_name: backend.name(),
            state: Mutex::new(State {
                backend,
                immutable: ports,
            }),
            events: None,
        }
    }

    /// Publishes rule changes and rollbacks on `hub`.
    pub fn with_events(mut self, hub: HubHandle) -> Self {
        self.events = Some(hub);
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend_name
    }

    fn emit(&self, change: RuleChange, rule_id: Option<String>, rules: Vec<Rule>) {
        if let Some(hub) = &self.events {
            hub.emit_rule_change(change, rule_id, rules);
        }
    }

    fn emit_port(&self, change: RuleChange, port: ImmutablePort) {
        if let Some(hub) = &self.events {
            hub.emit_port_change(change, port);
        }
    }

    /// Opens every configured immutable port.
    ///
    /// Runs at startup and after every structural change to repair state an
    /// external actor may have altered.
    pub async fn ensure_immutable_ports(&self) -> Result<()> {
        self.state.lock().await.ensure_immutable().await
    }

    pub async fn add_rule(&self, rule: Rule) -> Result<()> {
        let mut state = self.state.lock().await;
        admit(&rule, &state.immutable)?;
        state.backend.add_rule(&rule).await?;
        drop(state);

        info!("Rule added: {rule}");
        self.emit(RuleChange::Added, Some(rule.id.clone()), vec![rule]);
        Ok(())
    }

    /// Removes a rule. Kernel-side failures are logged, not returned.
    pub async fn delete_rule(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let known = state.backend.is_tracked(id);
        if let Err(e) = state.backend.delete_rule(id).await {
            warn!("Kernel delete of '{id}' failed, rule forgotten anyway: {e}");
        }
        state.ensure_immutable().await?;
        drop(state);

        if known {
            info!("Rule deleted: {id}");
            self.emit(RuleChange::Deleted, Some(id.to_string()), Vec::new());
        } else {
            debug!("Delete of unknown rule '{id}'");
        }
        Ok(())
    }

    /// Installs a batch, all or nothing.
    ///
    /// Every rule is validated and policy-checked before the kernel is
    /// touched. On the first install failure, rules added by this batch are
    /// removed and rules it replaced are restored, then an [`Error::Batch`]
    /// naming the failing rule is returned.
    pub async fn apply_rules(&self, rules: Vec<Rule>) -> Result<()> {
        let mut state = self.state.lock().await;
        for rule in &rules {
            admit(rule, &state.immutable)?;
        }

        let mut undo = Vec::with_capacity(rules.len());
        for (index, rule) in rules.iter().enumerate() {
            let step = match state.tracked(&rule.id) {
                Some(previous) => Undo::Restore(previous),
                None => Undo::Remove(rule.id.clone()),
            };

            if let Err(e) = state.backend.add_rule(rule).await {
                warn!("Batch failed at rule #{index} ('{}'), rolling back {} rules", rule.id, undo.len());
                state.rollback(undo).await;
                if let Err(heal) = state.ensure_immutable().await {
                    warn!("Immutable ports not restored after rollback: {heal}");
                }
                drop(state);

                let err = Error::Batch {
                    index,
                    rule_id: rule.id.clone(),
                    source: Box::new(e),
                };
                if let Some(hub) = &self.events {
                    hub.emit_error("manager", err.to_string());
                }
                return Err(err);
            }

            // A rule repeated within the batch is undone by its first entry
            if !undo.iter().any(|u| matches!(u, Undo::Remove(id) if *id == rule.id)) {
                undo.push(step);
            }
        }

        state.ensure_immutable().await?;
        drop(state);

        info!("Applied batch of {} rules", rules.len());
        self.emit(RuleChange::Applied, None, rules);
        Ok(())
    }

    /// Clears every managed rule, then re-opens the immutable ports.
    pub async fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.backend.flush().await?;
        state.ensure_immutable().await?;
        drop(state);

        info!("Managed rules flushed");
        self.emit(RuleChange::Flushed, None, Vec::new());
        Ok(())
    }

    pub async fn list_rules(&self) -> Vec<Rule> {
        self.state.lock().await.backend.list_rules()
    }

    pub async fn immutable_ports(&self) -> Vec<ImmutablePort> {
        self.state.lock().await.immutable.clone()
    }

    /// Marks a port immutable and opens it right away, at the head of the
    /// inbound chain.
    ///
    /// Refused when an installed blocking rule already covers the port.
    /// Block-list entries do not count: the opening goes ahead of them.
    pub async fn add_immutable_port(&self, port: u16, protocol: Protocol) -> Result<()> {
        if port == 0 {
            return Err(Error::validation("port", "immutable port must be non-zero"));
        }
        if !protocol.has_ports() {
            return Err(Error::validation("protocol", format!("{protocol} has no ports")));
        }

        let mut state = self.state.lock().await;
        if state.immutable.iter().any(|p| p.port == port && p.protocol == protocol) {
            return Ok(());
        }

        let entry = ImmutablePort::new(port, protocol);
        let rules = state.backend.list_rules();
        for rule in rules.iter().filter(|r| !r.id.starts_with(BLOCK_PREFIX)) {
            check_policy(rule, std::slice::from_ref(&entry))?;
        }

        state.backend.ensure_port(&entry).await?;
        state.immutable.push(entry);
        drop(state);

        info!("Immutable port added: {entry}");
        self.emit_port(RuleChange::ImmutablePortAdded, entry);
        Ok(())
    }

    /// Drops a port from the immutable set. Default ports are refused.
    ///
    /// The opening rule stays installed; only the protection is lifted.
    pub async fn remove_immutable_port(&self, port: u16, protocol: Protocol) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(pos) = state
            .immutable
            .iter()
            .position(|p| p.port == port && p.protocol == protocol)
        else {
            debug!("{port}/{protocol} is not immutable");
            return Ok(());
        };

        let entry = state.immutable[pos];
        if entry.is_default {
            return Err(Error::Policy(format!("{entry} is a default immutable port and cannot be removed")));
        }
        state.immutable.remove(pos);
        drop(state);

        info!("Immutable port removed: {entry}");
        self.emit_port(RuleChange::ImmutablePortRemoved, entry);
        Ok(())
    }

    /// Copies packets handled by managed rules to NFLOG `group`.
    pub async fn setup_traffic_monitoring(&self, group: u16) -> Result<()> {
        let mut state = self.state.lock().await;
        state.backend.setup_logging(group).await?;
        info!("Traffic logging enabled on group {group} ({})", state.backend.name());
        Ok(())
    }

    /// Drops all inbound traffic from `cidr`, immutable ports excepted.
    ///
    /// Skips the immutable-port policy: the entry is appended after the
    /// immutable-port openings, which keep answering the blocked network.
    pub async fn block_source(&self, cidr: IpNetwork) -> Result<()> {
        let rule = Rule::new(Rule::block_id(&cidr), Direction::Inbound, Protocol::All, Action::Drop).from_source(cidr);
        rule.validate()?;

        let mut state = self.state.lock().await;
        state.backend.add_rule(&rule).await?;
        drop(state);

        info!("Source blocked: {cidr}");
        self.emit(RuleChange::Added, Some(rule.id.clone()), vec![rule]);
        Ok(())
    }

    pub async fn unblock_source(&self, cidr: IpNetwork) -> Result<()> {
        self.delete_rule(&Rule::block_id(&cidr)).await
    }
}
