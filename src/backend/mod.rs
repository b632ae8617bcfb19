//! Kernel packet-filter backends
//!
//! A [`Backend`] turns abstract [`Rule`]s into mechanism-specific kernel
//! state. Exactly one backend exists per process; it is chosen once at
//! startup by [`create_backend`] and then owned by the
//! [`Manager`](crate::manager::Manager), which is the only caller.
//!
//! - [`iptables`]: shells out to `iptables`
//! - [`nftables`]: shells out to `nft --json`
//! - [`memory`]: in-memory stand-in with no kernel effect (non-Linux hosts, tests)
//!
//! All managed rules live in dedicated chains reached from the built-in
//! chains through one jump rule, so [`Backend::flush`] never touches the
//! host's own firewall configuration.

pub mod iptables;
pub mod memory;
pub mod nftables;
mod tracker;

pub use tracker::RuleTracker;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::error::{Error, Result};
use crate::core::rule::{Action, Direction, ImmutablePort, Rule};
use crate::elevation::{Tool, tool_command};

/// Comment tag prefix identifying hostwall-managed kernel entries
pub const COMMENT_PREFIX: &str = "hostwall:";

/// Comment on the catch-all log entry closing each managed chain while
/// logging is on. It has no `:`, so no rule id can produce it.
pub const DEFAULT_LOG_COMMENT: &str = "hostwall-default";

/// Operations every kernel mechanism provides
///
/// Mutating methods take `&mut self`: the owner serializes access.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Mechanism name for logs and status output
    fn name(&self) -> &'static str;

    /// Rules currently tracked by this backend, in installation order
    fn list_rules(&self) -> Vec<Rule>;

    fn is_tracked(&self, id: &str) -> bool;

    /// Installs a rule in its managed chain, tagged with its id.
    ///
    /// Re-adding an id that is already tracked never creates a second kernel
    /// entry. Replacing a tracked rule installs the new form before the old
    /// one is removed, so a failed replace leaves the old rule in force.
    async fn add_rule(&mut self, rule: &Rule) -> Result<()>;

    /// Like [`Backend::add_rule`], but places the rule at the head of its
    /// managed chain, ahead of every rule added with `add_rule`.
    async fn insert_rule(&mut self, rule: &Rule) -> Result<()>;

    /// Removes the kernel entry for `id`.
    ///
    /// The tracker entry is dropped even when the kernel delete fails; the
    /// failure is still returned so the caller can log it.
    async fn delete_rule(&mut self, id: &str) -> Result<()>;

    /// Clears every managed rule from the dedicated chains.
    async fn flush(&mut self) -> Result<()>;

    /// Copies every packet entering the managed chains to NFLOG `group`:
    /// packets a rule handles carry that rule's verdict in their prefix,
    /// the rest are caught by a final entry tagged [`DEFAULT_LOG_COMMENT`].
    async fn setup_logging(&mut self, group: u16) -> Result<()>;

    /// Guarantees the opening rule of `port` exists at the head of the
    /// inbound chain, where no blocking rule can shadow it. No-op when
    /// already tracked.
    async fn ensure_port(&mut self, port: &ImmutablePort) -> Result<()> {
        let rule = port.opening_rule();
        if self.is_tracked(&rule.id) {
            return Ok(());
        }
        debug!("{}: opening port {port}", self.name());
        self.insert_rule(&rule).await
    }
}

/// Which mechanism to construct
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BackendKind {
    /// nftables if `nft` is available, else iptables, else memory
    #[default]
    Auto,
    Iptables,
    Nftables,
    Memory,
}

impl BackendKind {
    /// Resolves `Auto` to a concrete mechanism for this host.
    pub fn resolve(self) -> BackendKind {
        match self {
            BackendKind::Auto => {
                if !cfg!(target_os = "linux") {
                    BackendKind::Memory
                } else if Tool::Nft.is_available() {
                    BackendKind::Nftables
                } else if Tool::Iptables.is_available() {
                    BackendKind::Iptables
                } else {
                    warn!("Neither nft nor iptables found; using in-memory backend");
                    BackendKind::Memory
                }
            }
            other => other,
        }
    }
}

/// Constructs the process-wide backend.
///
/// Construction creates the dedicated chains and the jump rules, so it fails
/// if the mechanism is unusable on this host.
pub async fn create_backend(kind: BackendKind) -> Result<Box<dyn Backend>> {
    let kind = kind.resolve();
    info!("Initializing {kind} backend");
    let backend: Box<dyn Backend> = match kind {
        BackendKind::Iptables => Box::new(iptables::IptablesBackend::new().await?),
        BackendKind::Nftables => Box::new(nftables::NftablesBackend::new().await?),
        BackendKind::Memory | BackendKind::Auto => Box::new(memory::MemoryBackend::new()),
    };
    Ok(backend)
}

/// Name of the managed chain for a direction, also used in log prefixes
pub const fn chain_label(direction: Direction) -> &'static str {
    match direction {
        Direction::Inbound => "HOSTWALL-IN",
        Direction::Outbound => "HOSTWALL-OUT",
    }
}

/// Kernel log prefix encoding chain and verdict, e.g. `HOSTWALL-IN:DROP:`
pub fn log_prefix(direction: Direction, action: Action) -> String {
    format!("{}:{}:", chain_label(direction), action.as_str())
}

/// Comment used to tag a rule's kernel entries
pub fn rule_comment(id: &str) -> String {
    format!("{COMMENT_PREFIX}{id}")
}

/// Runs a packet-filter tool, returning stdout on success.
pub(crate) async fn run_tool(tool: Tool, args: &[&str], stdin: Option<&str>) -> Result<String> {
    use std::process::Stdio;
    use tokio::io::AsyncWriteExt;

    let mut cmd = tool_command(tool, args)?;
    cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| Error::Command {
        tool: tool.program(),
        message: format!("failed to spawn: {e}"),
        stderr: None,
        exit_code: None,
    })?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes()).await?;
        pipe.shutdown().await?;
    }

    let output = child.wait_with_output().await?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        debug!("{} {:?} failed: {}", tool, args, stderr);
        Err(Error::Command {
            tool: tool.program(),
            message: if stderr.is_empty() {
                format!("exited with {}", output.status)
            } else {
                stderr.clone()
            },
            stderr: Some(stderr),
            exit_code: output.status.code(),
        })
    }
}
