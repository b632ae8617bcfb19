//! nftables backend
//!
//! Everything lives in table `inet hostwall`: two base chains hooked into
//! input/output whose only rule is a jump into the managed chains
//! `HOSTWALL-IN` / `HOSTWALL-OUT`. Rules are added through `nft --json` with
//! `--echo --handle` so the kernel handle of each rule is known and deletes
//! are exact.
//!
//! With logging enabled the `log` statement is part of the rule itself, ahead
//! of the verdict, and each managed chain ends in a rule holding only a `log`
//! statement for the packets no managed rule matched. New rules are inserted
//! before that rule; immutable-port openings go to the head of the chain.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{Backend, DEFAULT_LOG_COMMENT, RuleTracker, chain_label, log_prefix, rule_comment, run_tool};
use crate::core::error::{Error, Result};
use crate::core::rule::{Action, Direction, Protocol, Rule};
use crate::elevation::Tool;

pub const TABLE: &str = "hostwall";
const FAMILY: &str = "inet";

const BASE_CHAINS: [(&str, Direction); 2] = [("input", Direction::Inbound), ("output", Direction::Outbound)];

pub struct NftablesBackend {
    tracker: RuleTracker<u64>,
    log_group: Option<u16>,
    /// Handles of the default log rules, one per managed chain
    trailers: Vec<(Direction, u64)>,
}

/// Where a new rule goes in its managed chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Append,
    Head,
    /// Right before the rule with this handle
    Before(u64),
}

async fn nft_json(payload: &Value, echo: bool) -> Result<String> {
    let body = serde_json::to_string(payload)?;
    let args: &[&str] = if echo {
        &["--echo", "--handle", "--json", "-f", "-"]
    } else {
        &["--json", "-f", "-"]
    };
    run_tool(Tool::Nft, args, Some(&body)).await
}

/// Creates a match expression for nft meta keys
fn meta_match(key: &str, value: impl serde::Serialize) -> Value {
    json!({
        "match": {
            "left": { "meta": { "key": key } },
            "op": "==",
            "right": value
        }
    })
}

fn payload_match(protocol: &str, field: &str, value: Value) -> Value {
    json!({
        "match": {
            "left": { "payload": { "protocol": protocol, "field": field } },
            "op": "==",
            "right": value
        }
    })
}

/// Builds the expression list for a rule.
pub fn rule_expr(rule: &Rule, log_group: Option<u16>) -> Vec<Value> {
    let mut expr = Vec::with_capacity(6);

    if rule.protocol != Protocol::All {
        expr.push(meta_match("l4proto", rule.protocol.as_str()));
    }

    if let Some(src) = rule.source_cidr {
        let family = if src.is_ipv6() { "ip6" } else { "ip" };
        expr.push(payload_match(family, "saddr", json!(src.to_string())));
    }

    if let Some(dst) = rule.dest_cidr {
        let family = if dst.is_ipv6() { "ip6" } else { "ip" };
        expr.push(payload_match(family, "daddr", json!(dst.to_string())));
    }

    if let Some(ports) = rule.ports() {
        let value = if ports.is_single() {
            json!(ports.start)
        } else {
            json!({ "range": [ports.start, ports.end] })
        };
        expr.push(payload_match(rule.protocol.as_str(), "dport", value));
    }

    if let Some(group) = log_group {
        expr.push(json!({
            "log": { "prefix": log_prefix(rule.direction, rule.action), "group": group }
        }));
    }

    expr.push(match rule.action {
        Action::Accept => json!({ "accept": null }),
        Action::Drop => json!({ "drop": null }),
        Action::Reject => json!({ "reject": null }),
    });

    expr
}

/// The `add rule` / `insert rule` command for a rule.
pub fn add_rule_payload(rule: &Rule, log_group: Option<u16>, placement: Placement) -> Value {
    let mut body = json!({
        "family": FAMILY,
        "table": TABLE,
        "chain": chain_label(rule.direction),
        "expr": rule_expr(rule, log_group),
        "comment": rule_comment(&rule.id)
    });
    let op = match placement {
        Placement::Append => "add",
        Placement::Head => "insert",
        Placement::Before(handle) => {
            body["position"] = json!(handle);
            "insert"
        }
    };

    let mut cmd = serde_json::Map::new();
    cmd.insert(op.to_string(), json!({ "rule": body }));
    json!({ "nftables": [Value::Object(cmd)] })
}

/// The rule closing a managed chain while logging is on.
///
/// Packets reaching it fall through to the base chain's accept policy.
pub fn default_log_payload(direction: Direction, group: u16) -> Value {
    json!({
        "nftables": [{
            "add": {
                "rule": {
                    "family": FAMILY,
                    "table": TABLE,
                    "chain": chain_label(direction),
                    "expr": [{ "log": { "prefix": log_prefix(direction, Action::Accept), "group": group } }],
                    "comment": DEFAULT_LOG_COMMENT
                }
            }
        }]
    })
}

fn delete_rule_payload(direction: Direction, handle: u64) -> Value {
    json!({
        "nftables": [{
            "delete": {
                "rule": {
                    "family": FAMILY,
                    "table": TABLE,
                    "chain": chain_label(direction),
                    "handle": handle
                }
            }
        }]
    })
}

/// Table, base chains, managed chains and jumps.
///
/// `add` is idempotent for tables and chains; base chains are flushed before
/// their jump is re-added so repeated construction never duplicates it.
pub fn setup_payload() -> Value {
    let mut cmds = vec![json!({ "add": { "table": { "family": FAMILY, "name": TABLE } } })];

    for (hook, direction) in BASE_CHAINS {
        let managed = chain_label(direction);
        cmds.push(json!({
            "add": {
                "chain": {
                    "family": FAMILY,
                    "table": TABLE,
                    "name": hook,
                    "type": "filter",
                    "hook": hook,
                    "prio": 0,
                    "policy": "accept"
                }
            }
        }));
        cmds.push(json!({ "add": { "chain": { "family": FAMILY, "table": TABLE, "name": managed } } }));
        cmds.push(json!({ "flush": { "chain": { "family": FAMILY, "table": TABLE, "name": hook } } }));
        cmds.push(json!({ "flush": { "chain": { "family": FAMILY, "table": TABLE, "name": managed } } }));
        cmds.push(json!({
            "add": {
                "rule": {
                    "family": FAMILY,
                    "table": TABLE,
                    "chain": hook,
                    "expr": [{ "jump": { "target": managed } }]
                }
            }
        }));
    }

    json!({ "nftables": cmds })
}

fn flush_payload() -> Value {
    let cmds: Vec<Value> = BASE_CHAINS
        .iter()
        .map(|(_, direction)| {
            json!({ "flush": { "chain": { "family": FAMILY, "table": TABLE, "name": chain_label(*direction) } } })
        })
        .collect();
    json!({ "nftables": cmds })
}

/// Extracts the rule handle from `nft --echo --handle --json` output.
pub fn parse_handle(echo: &str) -> Option<u64> {
    let value: Value = serde_json::from_str(echo).ok()?;
    value["nftables"].as_array()?.iter().find_map(|cmd| {
        ["add", "insert"]
            .iter()
            .find_map(|op| cmd.get(op))
            .or(Some(cmd))
            .and_then(|inner| inner.get("rule"))
            .and_then(|rule| rule.get("handle"))
            .and_then(Value::as_u64)
    })
}

fn no_handle(what: &str) -> Error {
    Error::Command {
        tool: "nft",
        message: format!("no handle echoed for {what}"),
        stderr: None,
        exit_code: None,
    }
}

impl NftablesBackend {
    pub async fn new() -> Result<Self> {
        nft_json(&setup_payload(), false).await?;
        info!("nftables table {FAMILY} {TABLE} ready");
        Ok(Self {
            tracker: RuleTracker::new(),
            log_group: None,
            trailers: Vec::new(),
        })
    }

    fn trailer(&self, direction: Direction) -> Option<u64> {
        self.trailers.iter().find(|(d, _)| *d == direction).map(|(_, h)| *h)
    }

    /// Appending placement: ahead of the default log rule when there is one.
    fn tail(&self, direction: Direction) -> Placement {
        self.trailer(direction).map_or(Placement::Append, Placement::Before)
    }

    async fn install(&self, rule: &Rule, placement: Placement) -> Result<u64> {
        let echo = nft_json(&add_rule_payload(rule, self.log_group, placement), true).await?;
        parse_handle(&echo).ok_or_else(|| no_handle(&format!("rule '{}'", rule.id)))
    }

    async fn remove(direction: Direction, handle: u64) -> Result<()> {
        nft_json(&delete_rule_payload(direction, handle), false).await.map(|_| ())
    }

    async fn add_trailers(&mut self, group: u16) -> Result<()> {
        for (_, direction) in BASE_CHAINS {
            let echo = nft_json(&default_log_payload(direction, group), true).await?;
            let handle = parse_handle(&echo).ok_or_else(|| no_handle(chain_label(direction)))?;
            self.trailers.push((direction, handle));
        }
        Ok(())
    }

    /// Installs `rule` at `placement`, then drops the entry it replaces.
    ///
    /// Returns the new handle, or `None` when the rule was already installed
    /// as is. The caller records the handle.
    async fn place(&mut self, rule: &Rule, placement: Placement) -> Result<Option<u64>> {
        let replaced = match self.tracker.get(&rule.id) {
            Some(existing) if existing.rule == *rule => return Ok(None),
            Some(existing) => Some((existing.rule.direction, existing.handle)),
            None => None,
        };

        let handle = self.install(rule, placement).await?;
        if let Some((direction, old)) = replaced {
            debug!("Replacing {} (handle {old} -> {handle})", rule.id);
            if let Err(e) = Self::remove(direction, old).await {
                warn!("Replacing {}: old handle {old} not removed: {e}", rule.id);
            }
            self.tracker.remove(&rule.id);
        }
        Ok(Some(handle))
    }
}

#[async_trait]
impl Backend for NftablesBackend {
    fn name(&self) -> &'static str {
        "nftables"
    }

    fn list_rules(&self) -> Vec<Rule> {
        self.tracker.rules()
    }

    fn is_tracked(&self, id: &str) -> bool {
        self.tracker.contains(id)
    }

    async fn add_rule(&mut self, rule: &Rule) -> Result<()> {
        let placement = self.tail(rule.direction);
        if let Some(handle) = self.place(rule, placement).await? {
            self.tracker.insert(rule.clone(), handle);
        }
        Ok(())
    }

    async fn insert_rule(&mut self, rule: &Rule) -> Result<()> {
        if let Some(handle) = self.place(rule, Placement::Head).await? {
            self.tracker.insert_first(rule.clone(), handle);
        }
        Ok(())
    }

    async fn delete_rule(&mut self, id: &str) -> Result<()> {
        let Some(tracked) = self.tracker.remove(id) else {
            return Ok(());
        };
        Self::remove(tracked.rule.direction, tracked.handle).await
    }

    async fn flush(&mut self) -> Result<()> {
        nft_json(&flush_payload(), false).await?;
        self.tracker.clear();
        self.trailers.clear();
        if let Some(group) = self.log_group {
            self.add_trailers(group).await?;
        }
        Ok(())
    }

    async fn setup_logging(&mut self, group: u16) -> Result<()> {
        if self.log_group == Some(group) {
            return Ok(());
        }

        for (direction, handle) in std::mem::take(&mut self.trailers) {
            if let Err(e) = Self::remove(direction, handle).await {
                warn!("Old default log rule {handle} not removed: {e}");
            }
        }
        self.log_group = Some(group);

        // Replace every tracked rule with a logging copy, in order
        let tracked: Vec<(Rule, u64)> = self.tracker.iter().map(|t| (t.rule.clone(), t.handle)).collect();
        for (rule, old) in &tracked {
            let handle = self.install(rule, Placement::Append).await?;
            self.tracker.insert(rule.clone(), handle);
            if let Err(e) = Self::remove(rule.direction, *old).await {
                warn!("Logging copy of {} installed, old handle {old} not removed: {e}", rule.id);
            }
        }

        self.add_trailers(group).await?;
        info!("nftables logging to NFLOG group {group} ({} rules)", tracked.len());
        Ok(())
    }
}
