use anyhow::{Context, Result};
use regex::Regex;
use std::path::PathBuf;
use tracing::warn;

/// Runtime configuration, resolved once from the environment at startup.
///
/// Per-tenant resource limits are deliberately NOT stored here: they are
/// re-read from the environment at every terminal creation (see
/// [`crate::limits::TenantLimits::from_env`]).
#[derive(Debug, Clone)]
pub struct Config {
    /// Shell spawned for every interactive terminal.
    pub default_shell: String,
    /// Command names refused by both execute paths.
    pub blocked_commands: Vec<Regex>,
    pub log_level: String,
    pub audit_log_file: PathBuf,
    pub audit_log_max_size_bytes: u64,
    /// Per-stream output buffer cap; oldest bytes are dropped beyond it.
    pub buffer_max_bytes: usize,
    /// Cgroup v2 mount point.
    pub cgroup_root: PathBuf,
    /// Directory under the cgroup root holding per-tenant cgroups.
    pub cgroup_parent: String,
}

fn expand_tilde(path_str: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path_str).into_owned())
}

fn default_shell() -> String {
    if let Ok(shell) = std::env::var("SHELL") {
        if !shell.is_empty() {
            return shell;
        }
    }
    which::which("bash")
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "/bin/sh".to_string())
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let default_shell = std::env::var("DEFAULT_SHELL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(default_shell);

        let blocked_commands_str = std::env::var("BLOCKED_COMMANDS")
            .unwrap_or_else(|_| "sudo,su,rm,mkfs,fdisk,dd,reboot,shutdown,poweroff,halt,format,mount,umount,passwd,adduser,useradd,usermod,groupadd".to_string());
        let blocked_commands = blocked_commands_str
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            // Match command if it's the first word, possibly preceded by env vars
            .map(|s| Regex::new(&format!(r"^(?:[a-zA-Z_][a-zA-Z0-9_]*=[^ ]* )*{}(?:\s.*|$)", regex::escape(s))).context(format!("Invalid regex for blocked command: {}", s)))
            .collect::<Result<Vec<Regex>>>()?;

        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let log_dir_base = std::env::var("MCP_LOG_DIR")
            .ok()
            .filter(|s| !s.is_empty())
            .map(|s| expand_tilde(&s))
            .unwrap_or_else(|| expand_tilde("~/.mcp-tenant-shell"));

        let audit_log_file = log_dir_base.join("operations.log");
        let audit_log_max_size_bytes = std::env::var("AUDIT_LOG_MAX_SIZE_MB")
            .unwrap_or_else(|_| "10".to_string())
            .parse::<u64>()
            .map(|mb| mb * 1024 * 1024)
            .unwrap_or(10 * 1024 * 1024);

        let buffer_max_bytes = match std::env::var("TERMINAL_BUFFER_MAX_BYTES") {
            Ok(v) => v.parse::<usize>().unwrap_or_else(|_| {
                warn!(value = %v, "Invalid TERMINAL_BUFFER_MAX_BYTES, using default");
                1_048_576
            }),
            Err(_) => 1_048_576,
        };

        let cgroup_root = std::env::var("CGROUP_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/sys/fs/cgroup"));

        let cgroup_parent =
            std::env::var("CGROUP_PARENT").unwrap_or_else(|_| "mcp-tenants".to_string());

        Ok(Config {
            default_shell,
            blocked_commands,
            log_level,
            audit_log_file,
            audit_log_max_size_bytes,
            buffer_max_bytes,
            cgroup_root,
            cgroup_parent,
        })
    }

    /// True if the first word of `command_str` (skipping leading VAR=val
    /// assignments) matches any blocked-command pattern.
    pub fn is_command_blocked(&self, command_str: &str) -> bool {
        let effective_command = command_str
            .trim_start()
            .split_whitespace()
            .find(|s| !s.contains('='))
            .unwrap_or("");

        self.blocked_commands
            .iter()
            .any(|regex| regex.is_match(effective_command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config(blocked: &[&str]) -> Config {
        let blocked_commands = blocked
            .iter()
            .map(|s| {
                Regex::new(&format!(
                    r"^(?:[a-zA-Z_][a-zA-Z0-9_]*=[^ ]* )*{}(?:\s.*|$)",
                    regex::escape(s)
                ))
                .unwrap()
            })
            .collect();
        Config {
            default_shell: "/bin/sh".to_string(),
            blocked_commands,
            log_level: "info".to_string(),
            audit_log_file: std::env::temp_dir().join("mcp-tenant-shell-test.log"),
            audit_log_max_size_bytes: 1024,
            buffer_max_bytes: 1_048_576,
            cgroup_root: PathBuf::from("/nonexistent-cgroup-root"),
            cgroup_parent: "mcp-tenants".to_string(),
        }
    }

    #[test]
    fn test_blocked_command_first_word() {
        let config = minimal_config(&["rm", "shutdown"]);
        assert!(config.is_command_blocked("rm -rf /"));
        assert!(config.is_command_blocked("shutdown"));
        assert!(!config.is_command_blocked("echo rm"));
        assert!(!config.is_command_blocked("format_output"));
    }

    #[test]
    fn test_blocked_command_skips_env_assignments() {
        let config = minimal_config(&["rm"]);
        assert!(config.is_command_blocked("FOO=bar rm -rf /"));
        assert!(!config.is_command_blocked("FOO=rm echo hi"));
    }

    #[test]
    fn test_expand_tilde() {
        assert_eq!(expand_tilde("/var/log"), PathBuf::from("/var/log"));
        if let Ok(home) = std::env::var("HOME") {
            assert_eq!(expand_tilde("~/logs"), PathBuf::from(home).join("logs"));
        }
    }

    #[test]
    fn test_load_defaults() {
        let config = Config::load().expect("load config");
        assert!(!config.default_shell.is_empty());
        assert!(!config.blocked_commands.is_empty());
        assert!(config.buffer_max_bytes > 0);
        assert_eq!(config.cgroup_parent, "mcp-tenants");
    }
}
