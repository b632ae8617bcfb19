//! Directory and system lookups
//!
//! - Config: `~/.config/hostwall/` (XDG), holds `config.json`
//! - Interfaces: `/sys/class/net/<name>/ifindex`

use directories::ProjectDirs;
use std::path::{Path, PathBuf};

const SYS_CLASS_NET: &str = "/sys/class/net";

pub fn get_config_dir() -> Option<PathBuf> {
    ProjectDirs::from("org", "hostwall", "hostwall").map(|pd| pd.config_dir().to_path_buf())
}

/// Default location of the daemon configuration file.
pub fn default_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("config.json"))
}

fn lookup_interface(root: &Path, index: u32) -> Option<String> {
    std::fs::read_dir(root)
        .ok()?
        .flatten()
        .find(|entry| {
            std::fs::read_to_string(entry.path().join("ifindex"))
                .ok()
                .and_then(|s| s.trim().parse::<u32>().ok())
                == Some(index)
        })
        .and_then(|entry| entry.file_name().into_string().ok())
}

/// Name of the network interface with kernel index `index`.
pub fn interface_name(index: u32) -> Option<String> {
    lookup_interface(Path::new(SYS_CLASS_NET), index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_interface_in_sysfs_tree() {
        let root = tempfile::tempdir().unwrap();
        for (name, index) in [("lo", "1\n"), ("eth0", "2\n"), ("wg0", "7\n")] {
            let dir = root.path().join(name);
            std::fs::create_dir(&dir).unwrap();
            std::fs::write(dir.join("ifindex"), index).unwrap();
        }

        assert_eq!(lookup_interface(root.path(), 2).as_deref(), Some("eth0"));
        assert_eq!(lookup_interface(root.path(), 7).as_deref(), Some("wg0"));
        assert_eq!(lookup_interface(root.path(), 9), None);
        assert_eq!(lookup_interface(&root.path().join("missing"), 1), None);
    }

    #[test]
    fn test_default_config_path_file_name() {
        if let Some(path) = default_config_path() {
            assert!(path.ends_with("config.json"));
        }
    }
}
