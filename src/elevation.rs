//! Privileged command construction for the packet-filter tools
//!
//! hostwall normally runs as root and invokes `iptables` / `nft` directly.
//! When it does not, commands are wrapped in an elevation helper. Only the
//! two packet-filter tools can be elevated.
//!
//! # Resolution order
//!
//! 1. `HOSTWALL_IPTABLES_COMMAND` / `HOSTWALL_NFT_COMMAND`: replace the tool
//!    with another command line (whitespace separated). Used by the test
//!    suite to point at mock scripts; never elevated.
//! 2. Running as root: the tool is executed directly.
//! 3. `HOSTWALL_ELEVATION_METHOD`: force `sudo`, `run0` or `pkexec`.
//! 4. Automatic: `run0` when available, else non-interactive `sudo`.
//!
//! # Security
//!
//! Arguments are passed directly without shell interpretation. Callers
//! validate rule ids and prefixes before building arguments.

use std::io;
use tokio::process::Command;

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `HOSTWALL_ELEVATION_METHOD`
    #[error("Invalid HOSTWALL_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),

    /// A command override variable was set but empty
    #[error("{0} is set but contains no command")]
    EmptyOverride(&'static str),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// The packet-filter control tools hostwall is allowed to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
pub enum Tool {
    #[strum(serialize = "iptables")]
    Iptables,
    #[strum(serialize = "nft")]
    Nft,
}

impl Tool {
    pub const fn program(self) -> &'static str {
        match self {
            Tool::Iptables => "iptables",
            Tool::Nft => "nft",
        }
    }

    const fn override_var(self) -> &'static str {
        match self {
            Tool::Iptables => "HOSTWALL_IPTABLES_COMMAND",
            Tool::Nft => "HOSTWALL_NFT_COMMAND",
        }
    }

    /// True if the tool can be run: either overridden or present in PATH.
    pub fn is_available(self) -> bool {
        std::env::var_os(self.override_var()).is_some() || binary_exists(self.program())
    }
}

/// Checks if a binary exists in PATH
pub fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

fn wrapped(helper: &str, helper_args: &[&str], program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(helper);
    cmd.args(helper_args).arg(program).args(args);
    cmd
}

/// Builds the command that runs `tool` with `args`, elevating if necessary.
///
/// # Errors
///
/// Returns `Err` if an override is empty, the forced elevation method is
/// unknown, or its binary is missing.
pub fn tool_command(tool: Tool, args: &[&str]) -> Result<Command, ElevationError> {
    // 1. Explicit command override (mock scripts in tests)
    if let Ok(line) = std::env::var(tool.override_var()) {
        let mut parts = line.split_whitespace();
        let program = parts.next().ok_or(ElevationError::EmptyOverride(tool.override_var()))?;
        let mut cmd = Command::new(program);
        cmd.args(parts).args(args);
        return Ok(cmd);
    }

    let program = tool.program();

    // 2. Direct root execution
    if nix::unistd::geteuid().is_root() {
        let mut cmd = Command::new(program);
        cmd.args(args);
        return Ok(cmd);
    }

    // 3. Explicit elevation method
    if let Ok(method) = std::env::var("HOSTWALL_ELEVATION_METHOD") {
        let method = method.to_lowercase();
        if !method.is_empty() {
            return match method.as_str() {
                "sudo" | "run0" | "pkexec" => {
                    if !binary_exists(&method) {
                        return Err(ElevationError::MethodNotAvailable(method));
                    }
                    let helper_args: &[&str] = if method == "sudo" { &["-n"] } else { &[] };
                    Ok(wrapped(&method, helper_args, program, args))
                }
                _ => Err(ElevationError::InvalidMethod(method)),
            };
        }
    }

    // 4. Automatic detection. A daemon has no terminal, so sudo must not prompt.
    if binary_exists("run0") {
        return Ok(wrapped("run0", &[], program, args));
    }
    Ok(wrapped("sudo", &["-n"], program, args))
}
