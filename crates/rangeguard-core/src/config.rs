//! Configuration tree
//!
//! Loaded once at startup from a JSON file; rule sections (whitelist,
//! deny patterns, breakout signatures) compile into immutable snapshots
//! inside the security crate. Reloading produces a new snapshot that is
//! swapped in atomically, never mutated in place.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RangeGuardConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub validator: ValidatorConfig,
    #[serde(default)]
    pub breakout: BreakoutConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

impl RangeGuardConfig {
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| crate::RangeGuardError::Config(format!("read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| crate::RangeGuardError::Config(format!("parse {}: {}", path.display(), e)))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> crate::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

/// HTTP service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 18750,
            log_level: "info".to_string(),
        }
    }
}

/// One whitelisted tool with optional allowed-argument patterns.
///
/// An empty `arg_patterns` list means any arguments are accepted (the
/// deny-pattern scan still applies to the full command text).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRule {
    pub name: String,
    #[serde(default)]
    pub arg_patterns: Vec<String>,
}

impl ToolRule {
    pub fn any_args(name: &str) -> Self {
        Self {
            name: name.to_string(),
            arg_patterns: vec![],
        }
    }
}

/// Command validator rules. The whitelist contents are injected data;
/// the defaults below cover the standard range toolset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    pub tools: Vec<ToolRule>,
    pub deny_patterns: Vec<String>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        let tools = [
            "nmap", "masscan", "nikto", "sqlmap", "gobuster", "dirb", "wpscan",
            "hydra", "john", "hashcat", "msfconsole", "msfvenom", "searchsploit",
            "enum4linux", "smbclient", "smbmap", "crackmapexec", "responder",
            "tcpdump", "tshark", "wireshark", "aircrack-ng", "netcat", "nc",
            "curl", "wget", "whois", "dig", "nslookup", "host", "ping",
            "traceroute", "whatweb", "wafw00f", "dnsenum", "fierce", "amass",
            "subfinder", "ffuf", "wfuzz", "hashid", "cewl", "crunch",
            "ls", "cat", "grep", "awk", "sed", "cut", "sort", "uniq", "head",
            "tail", "wc", "find", "file", "strings", "base64", "xxd", "echo",
            "python3", "perl", "ruby",
        ]
        .iter()
        .map(|t| ToolRule::any_args(t))
        .collect();

        let deny_patterns = vec![
            // destructive filesystem operations
            r"rm\s+(-[a-z]*\s+)*(/|/\*|--no-preserve-root)".to_string(),
            r"mkfs(\.[a-z0-9]+)?\s".to_string(),
            r"\bdd\s+.*of=/dev/".to_string(),
            r">\s*/dev/(sd[a-z]|nvme|hd[a-z])".to_string(),
            r"shred\s+.*/dev/".to_string(),
            // raw device and system file tampering
            r"/dev/(mem|kmem|port)".to_string(),
            r">\s*/etc/(passwd|shadow|sudoers)".to_string(),
            // fork bombs and shell-chain injection
            r":\(\)\s*\{.*\};\s*:".to_string(),
            r";\s*(rm|mkfs|dd)\b".to_string(),
            r"\|\s*sh\s*$".to_string(),
            r"\|\s*bash\s*$".to_string(),
            r"`[^`]*`".to_string(),
            r"\$\([^)]*\)".to_string(),
        ];

        Self {
            tools,
            deny_patterns,
        }
    }
}

/// Breakout monitor configuration. The built-in signature table lives in
/// the security crate; `extra_signatures` appends deployment-specific
/// patterns to it.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BreakoutConfig {
    #[serde(default)]
    pub extra_signatures: Vec<String>,
}

/// Per-user sliding window limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Window duration W (seconds)
    pub window_secs: u64,
    /// Max requests N within the window
    pub max_requests: usize,
    /// Block duration applied once the window is exhausted (seconds)
    pub cooldown_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: 300,
            max_requests: 100,
            cooldown_secs: 60,
        }
    }
}

/// Audit log sizing and retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Hard cap on buffered events; appends fail once reached (fail
    /// closed, never silently dropped).
    pub max_events: usize,
    /// Events older than this are eligible for the explicit expiry sweep.
    pub retention_days: i64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_events: 100_000,
            retention_days: 90,
        }
    }
}

/// Container lifecycle tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Sandbox image the toolset ships in
    pub image: String,
    /// Idle max age before the sweep terminates a container (seconds)
    pub idle_max_secs: i64,
    /// Docker network name backing the training segment
    pub training_network: String,
    /// Docker network name backing the isolated segment
    pub isolated_network: String,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            image: "rangeguard/toolbox:latest".to_string(),
            idle_max_secs: 3600,
            training_network: "range-training".to_string(),
            isolated_network: "range-isolated".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_whitelist_contains_core_tools() {
        let config = ValidatorConfig::default();
        assert!(config.tools.iter().any(|t| t.name == "nmap"));
        assert!(config.tools.iter().any(|t| t.name == "sqlmap"));
        assert!(!config.tools.iter().any(|t| t.name == "docker"));
    }

    #[test]
    fn test_rate_limit_defaults() {
        let config = RateLimitConfig::default();
        assert_eq!(config.window_secs, 300);
        assert_eq!(config.max_requests, 100);
    }

    #[test]
    fn test_config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rangeguard.json");

        let config = RangeGuardConfig::default();
        config.save(&path).unwrap();

        let loaded = RangeGuardConfig::load(&path).unwrap();
        assert_eq!(loaded.rate_limit.max_requests, config.rate_limit.max_requests);
        assert_eq!(loaded.lifecycle.image, config.lifecycle.image);
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let err = RangeGuardConfig::load(Path::new("/nonexistent/rangeguard.json")).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let parsed: RangeGuardConfig =
            serde_json::from_str(r#"{"rate_limit":{"window_secs":60,"max_requests":10,"cooldown_secs":5}}"#)
                .unwrap();
        assert_eq!(parsed.rate_limit.max_requests, 10);
        assert_eq!(parsed.audit.retention_days, 90);
    }
}
