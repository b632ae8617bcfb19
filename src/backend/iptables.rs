//! iptables backend
//!
//! Managed rules live in two user chains, `HOSTWALL-IN` (jumped to from
//! `INPUT`) and `HOSTWALL-OUT` (jumped to from `OUTPUT`). Every kernel entry
//! carries a `-m comment --comment hostwall:<id>` tag so deletes rebuild the
//! exact rule specification from the tracker.
//!
//! When logging is enabled each rule is preceded by an `NFLOG` entry with the
//! same matches, so the packet is copied to the log group with a prefix that
//! names the verdict the next entry applies. A last untagged `NFLOG` entry in
//! each chain copies the packets no rule matched.
//!
//! Rules from [`Backend::add_rule`] are appended ahead of that last entry;
//! immutable-port openings go to the head of the chain.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{Backend, DEFAULT_LOG_COMMENT, RuleTracker, chain_label, log_prefix, rule_comment, run_tool};
use crate::core::error::{Error, Result};
use crate::core::rule::{Action, Direction, Protocol, Rule};
use crate::elevation::Tool;

const BUILTIN_CHAINS: [(&str, Direction); 2] =
    [("INPUT", Direction::Inbound), ("OUTPUT", Direction::Outbound)];

pub struct IptablesBackend {
    tracker: RuleTracker,
    log_group: Option<u16>,
}

async fn iptables(args: &[String]) -> Result<String> {
    let mut full: Vec<&str> = Vec::with_capacity(args.len() + 1);
    // Wait for the xtables lock instead of failing when another tool holds it
    full.push("-w");
    full.extend(args.iter().map(String::as_str));
    run_tool(Tool::Iptables, &full, None).await
}

fn owned(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| (*s).to_string()).collect()
}

/// Match part of a rule specification, shared by the verdict and log entries.
fn match_args(rule: &Rule) -> Vec<String> {
    let mut args = Vec::with_capacity(12);

    if rule.protocol != Protocol::All {
        args.extend(owned(&["-p", rule.protocol.as_str()]));
    }
    if let Some(src) = rule.source_cidr {
        args.push("-s".to_string());
        args.push(src.to_string());
    }
    if let Some(dst) = rule.dest_cidr {
        args.push("-d".to_string());
        args.push(dst.to_string());
    }
    if let Some(ports) = rule.ports() {
        args.push("--dport".to_string());
        args.push(if ports.is_single() {
            ports.start.to_string()
        } else {
            format!("{}:{}", ports.start, ports.end)
        });
    }
    args.extend(owned(&["-m", "comment", "--comment"]));
    args.push(rule_comment(&rule.id));
    args
}

/// Full specification of the verdict entry, without the `-A`/`-D` operation.
pub fn verdict_spec(rule: &Rule) -> Vec<String> {
    let mut args = vec![chain_label(rule.direction).to_string()];
    args.extend(match_args(rule));
    args.push("-j".to_string());
    args.push(rule.action.as_str().to_string());
    args
}

/// Full specification of the NFLOG entry preceding a rule.
pub fn log_spec(rule: &Rule, group: u16) -> Vec<String> {
    let mut args = vec![chain_label(rule.direction).to_string()];
    args.extend(match_args(rule));
    args.extend(owned(&["-j", "NFLOG", "--nflog-group"]));
    args.push(group.to_string());
    args.push("--nflog-prefix".to_string());
    args.push(log_prefix(rule.direction, rule.action));
    args
}

/// Catch-all NFLOG entry closing a managed chain while logging is on.
///
/// Packets reaching it matched no managed rule and fall through to the
/// built-in chain, so the prefix names ACCEPT.
pub fn default_log_spec(direction: Direction, group: u16) -> Vec<String> {
    let mut args = owned(&[chain_label(direction), "-m", "comment", "--comment", DEFAULT_LOG_COMMENT]);
    args.extend(owned(&["-j", "NFLOG", "--nflog-group"]));
    args.push(group.to_string());
    args.push("--nflog-prefix".to_string());
    args.push(log_prefix(direction, Action::Accept));
    args
}

fn with_op(op: &str, spec: &[String]) -> Vec<String> {
    let mut args = Vec::with_capacity(spec.len() + 1);
    args.push(op.to_string());
    args.extend_from_slice(spec);
    args
}

/// `-I <chain> 1 ...`: insert at the head of the chain.
fn at_head(spec: &[String]) -> Vec<String> {
    let mut args = with_op("-I", spec);
    args.insert(2, "1".to_string());
    args
}

/// Best-effort delete of the first entry matching `spec`.
async fn discard(spec: &[String]) {
    if let Err(e) = iptables(&with_op("-D", spec)).await {
        warn!("Could not remove '{}': {e}", spec.join(" "));
    }
}

fn check_family(rule: &Rule) -> Result<()> {
    if rule.source_cidr.is_some_and(|c| c.is_ipv6()) || rule.dest_cidr.is_some_and(|c| c.is_ipv6()) {
        return Err(Error::validation("source_cidr", "iptables backend manages IPv4 only"));
    }
    Ok(())
}

impl IptablesBackend {
    /// Creates the managed chains and the jumps into them, then clears the
    /// chains so kernel state matches the empty tracker.
    pub async fn new() -> Result<Self> {
        for (builtin, direction) in BUILTIN_CHAINS {
            let chain = chain_label(direction);
            match iptables(&owned(&["-N", chain])).await {
                Ok(_) => info!("Created chain {chain}"),
                Err(Error::Command { ref message, .. }) if message.contains("exists") => {
                    debug!("Chain {chain} already exists");
                }
                Err(e) => return Err(e),
            }

            if iptables(&owned(&["-C", builtin, "-j", chain])).await.is_err() {
                iptables(&owned(&["-I", builtin, "1", "-j", chain])).await?;
                info!("Inserted jump {builtin} -> {chain}");
            }

            iptables(&owned(&["-F", chain])).await?;
        }

        Ok(Self {
            tracker: RuleTracker::new(),
            log_group: None,
        })
    }

    /// Appends `spec` unless an identical entry already exists.
    async fn append_unique(spec: &[String]) -> Result<()> {
        if iptables(&with_op("-C", spec)).await.is_ok() {
            debug!("Entry already present: {}", spec.join(" "));
            return Ok(());
        }
        iptables(&with_op("-A", spec)).await.map(|_| ())
    }

    /// Removes both kernel entries of a rule, returning the first failure.
    async fn remove_entries(&self, rule: &Rule) -> Result<()> {
        let mut first_error = None;
        if let Some(group) = self.log_group
            && let Err(e) = iptables(&with_op("-D", &log_spec(rule, group))).await
        {
            first_error = Some(e);
        }
        if let Err(e) = iptables(&with_op("-D", &verdict_spec(rule))).await {
            first_error.get_or_insert(e);
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Appends a rule's entries, keeping the default log entry last.
    async fn install(&self, rule: &Rule) -> Result<()> {
        let Some(group) = self.log_group else {
            return Self::append_unique(&verdict_spec(rule)).await;
        };

        let trailer = default_log_spec(rule.direction, group);
        discard(&trailer).await;
        let result = Self::append_logged(rule, group).await;
        if let Err(e) = Self::append_unique(&trailer).await {
            warn!("Default-path logging on {} not restored: {e}", chain_label(rule.direction));
        }
        result
    }

    async fn append_logged(rule: &Rule, group: u16) -> Result<()> {
        let log = log_spec(rule, group);
        Self::append_unique(&log).await?;
        if let Err(e) = Self::append_unique(&verdict_spec(rule)).await {
            discard(&log).await;
            return Err(e);
        }
        Ok(())
    }

    /// Inserts a rule's entries at the head of its chain, log entry first.
    async fn install_at_head(&self, rule: &Rule) -> Result<()> {
        let verdict = verdict_spec(rule);
        iptables(&at_head(&verdict)).await?;
        if let Some(group) = self.log_group
            && let Err(e) = iptables(&at_head(&log_spec(rule, group))).await
        {
            discard(&verdict).await;
            return Err(e);
        }
        Ok(())
    }

    /// Drops the entries of a rule that was just superseded by `current`.
    async fn retire(&self, previous: &Rule, current: &Rule) {
        // Identical entries: -D would hit the one just installed
        if verdict_spec(previous) == verdict_spec(current) {
            return;
        }
        if let Err(e) = self.remove_entries(previous).await {
            warn!("Replacing {}: old entry not removed: {e}", current.id);
        }
    }

    async fn append_trailers(group: u16) -> Result<()> {
        for (_, direction) in BUILTIN_CHAINS {
            Self::append_unique(&default_log_spec(direction, group)).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for IptablesBackend {
    fn name(&self) -> &'static str {
        "iptables"
    }

    fn list_rules(&self) -> Vec<Rule> {
        self.tracker.rules()
    }

    fn is_tracked(&self, id: &str) -> bool {
        self.tracker.contains(id)
    }

    async fn add_rule(&mut self, rule: &Rule) -> Result<()> {
        check_family(rule)?;
        let previous = match self.tracker.get(&rule.id) {
            Some(existing) if existing.rule == *rule => return Ok(()),
            Some(existing) => Some(existing.rule.clone()),
            None => None,
        };

        self.install(rule).await?;
        if let Some(previous) = previous {
            self.retire(&previous, rule).await;
            self.tracker.remove(&rule.id);
        }
        self.tracker.insert(rule.clone(), ());
        Ok(())
    }

    async fn insert_rule(&mut self, rule: &Rule) -> Result<()> {
        check_family(rule)?;
        let previous = match self.tracker.get(&rule.id) {
            Some(existing) if existing.rule == *rule => return Ok(()),
            Some(existing) => Some(existing.rule.clone()),
            None => None,
        };

        self.install_at_head(rule).await?;
        if let Some(previous) = previous {
            self.retire(&previous, rule).await;
        }
        self.tracker.insert_first(rule.clone(), ());
        Ok(())
    }

    async fn delete_rule(&mut self, id: &str) -> Result<()> {
        let Some(tracked) = self.tracker.remove(id) else {
            return Ok(());
        };
        self.remove_entries(&tracked.rule).await
    }

    async fn flush(&mut self) -> Result<()> {
        for (_, direction) in BUILTIN_CHAINS {
            iptables(&owned(&["-F", chain_label(direction)])).await?;
        }
        self.tracker.clear();
        if let Some(group) = self.log_group {
            Self::append_trailers(group).await?;
        }
        Ok(())
    }

    /// Reinstalls every tracked rule with its NFLOG entry.
    ///
    /// Each rule gets its new entries appended before the old ones are
    /// deleted, so no rule is ever missing from the kernel. Going through
    /// the tracker in order keeps the chain order intact.
    async fn setup_logging(&mut self, group: u16) -> Result<()> {
        if self.log_group == Some(group) {
            return Ok(());
        }

        let previous = self.log_group;
        if let Some(old) = previous {
            for (_, direction) in BUILTIN_CHAINS {
                discard(&default_log_spec(direction, old)).await;
            }
        }

        let rules = self.tracker.rules();
        for rule in &rules {
            let log = log_spec(rule, group);
            let verdict = verdict_spec(rule);
            iptables(&with_op("-A", &log)).await?;
            if let Err(e) = iptables(&with_op("-A", &verdict)).await {
                discard(&log).await;
                return Err(e);
            }
            // First match is the old verdict, ahead of the copy just appended
            discard(&verdict).await;
            if let Some(old) = previous {
                discard(&log_spec(rule, old)).await;
            }
        }

        self.log_group = Some(group);
        Self::append_trailers(group).await?;
        info!("iptables logging to NFLOG group {group} ({} rules)", rules.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_spec_single_port() {
        let rule = Rule::new("ssh", Direction::Inbound, Protocol::Tcp, Action::Accept).with_port(22);
        assert_eq!(
            verdict_spec(&rule).join(" "),
            "HOSTWALL-IN -p tcp --dport 22 -m comment --comment hostwall:ssh -j ACCEPT"
        );
    }

    #[test]
    fn test_verdict_spec_range_and_networks() {
        let rule = Rule::new("web", Direction::Outbound, Protocol::Udp, Action::Reject)
            .with_port_range(6000, 6010)
            .from_source("10.0.0.0/8".parse().unwrap())
            .to_destination("192.0.2.0/24".parse().unwrap());
        assert_eq!(
            verdict_spec(&rule).join(" "),
            "HOSTWALL-OUT -p udp -s 10.0.0.0/8 -d 192.0.2.0/24 --dport 6000:6010 \
             -m comment --comment hostwall:web -j REJECT"
        );
    }

    #[test]
    fn test_all_protocol_omits_protocol_match() {
        let rule = Rule::new("blk", Direction::Inbound, Protocol::All, Action::Drop)
            .from_source("203.0.113.7/32".parse().unwrap());
        let spec = verdict_spec(&rule);
        assert!(!spec.contains(&"-p".to_string()));
        assert_eq!(spec.last().unwrap(), "DROP");
    }

    #[test]
    fn test_default_log_spec_is_untagged_accept() {
        let spec = default_log_spec(Direction::Outbound, 5).join(" ");
        assert_eq!(
            spec,
            "HOSTWALL-OUT -m comment --comment hostwall-default -j NFLOG --nflog-group 5 \
             --nflog-prefix HOSTWALL-OUT:ACCEPT:"
        );
        assert!(!spec.contains(crate::backend::COMMENT_PREFIX));
    }

    #[test]
    fn test_head_insert_args() {
        let rule = Rule::new("ssh", Direction::Inbound, Protocol::Tcp, Action::Accept).with_port(22);
        let args = at_head(&verdict_spec(&rule));
        assert_eq!(&args[..3], ["-I", "HOSTWALL-IN", "1"]);
        assert_eq!(args.last().unwrap(), "ACCEPT");
    }

    #[test]
    fn test_log_spec_carries_group_and_prefix() {
        let rule = Rule::new("blk", Direction::Inbound, Protocol::Tcp, Action::Drop).with_port(23);
        let spec = log_spec(&rule, 100).join(" ");
        assert!(spec.ends_with("-j NFLOG --nflog-group 100 --nflog-prefix HOSTWALL-IN:DROP:"));
        assert!(spec.contains("--comment hostwall:blk"));
    }
}
