//! Command validator: deny-pattern scan plus leading-token whitelist
//!
//! Rules compile once into an immutable [`CompiledRules`] snapshot;
//! `reload` swaps in a freshly compiled snapshot atomically. A validation
//! pass is pure and deterministic over the snapshot it reads.

use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use rangeguard_core::ValidatorConfig;

use crate::types::{DecidingLayer, DenyCode, SecurityError, ThreatLevel, ValidationVerdict};

/// Compiled rule snapshot. Read-only after construction.
pub struct CompiledRules {
    tools: HashMap<String, Vec<Regex>>,
    deny_patterns: Vec<Regex>,
}

impl CompiledRules {
    pub fn compile(config: &ValidatorConfig) -> Result<Self, SecurityError> {
        let mut tools = HashMap::new();
        for rule in &config.tools {
            let mut patterns = Vec::new();
            for pattern in &rule.arg_patterns {
                patterns.push(compile_insensitive(pattern)?);
            }
            tools.insert(rule.name.clone(), patterns);
        }

        let mut deny_patterns = Vec::new();
        for pattern in &config.deny_patterns {
            deny_patterns.push(compile_insensitive(pattern)?);
        }

        Ok(Self {
            tools,
            deny_patterns,
        })
    }
}

fn compile_insensitive(pattern: &str) -> Result<Regex, SecurityError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|source| SecurityError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })
}

pub struct CommandValidator {
    rules: RwLock<Arc<CompiledRules>>,
}

impl CommandValidator {
    pub fn new(config: &ValidatorConfig) -> Result<Self, SecurityError> {
        Ok(Self {
            rules: RwLock::new(Arc::new(CompiledRules::compile(config)?)),
        })
    }

    /// Compile a new snapshot and swap it in. A failed compile leaves the
    /// current snapshot untouched.
    pub async fn reload(&self, config: &ValidatorConfig) -> Result<(), SecurityError> {
        let compiled = Arc::new(CompiledRules::compile(config)?);
        *self.rules.write().await = compiled;
        debug!("validator rules reloaded");
        Ok(())
    }

    /// Validate one command. The deny-pattern scan runs first so that a
    /// destructive command is reported as DANGEROUS_PATTERN even when its
    /// executable is also outside the whitelist; the whitelist check then
    /// gates the leading token and, where configured, its arguments.
    pub async fn validate(&self, command: &str) -> ValidationVerdict {
        let rules = self.rules.read().await.clone();
        let trimmed = command.trim();

        if trimmed.is_empty() {
            return ValidationVerdict::deny(
                DecidingLayer::Whitelist,
                DenyCode::NotWhitelisted,
                ThreatLevel::Low,
                "empty command",
            );
        }

        for pattern in &rules.deny_patterns {
            if let Some(m) = pattern.find(trimmed) {
                warn!(command = %trimmed, matched = %m.as_str(), "deny pattern hit");
                return ValidationVerdict::deny(
                    DecidingLayer::Pattern,
                    DenyCode::DangerousPattern,
                    ThreatLevel::High,
                    format!("command matches deny pattern: '{}'", m.as_str()),
                );
            }
        }

        let mut parts = trimmed.splitn(2, char::is_whitespace);
        let executable = parts.next().unwrap_or_default();
        let args = parts.next().unwrap_or("").trim();

        let Some(arg_patterns) = rules.tools.get(executable) else {
            return ValidationVerdict::deny(
                DecidingLayer::Whitelist,
                DenyCode::NotWhitelisted,
                ThreatLevel::Medium,
                format!("executable '{}' is not whitelisted", executable),
            );
        };

        if !arg_patterns.is_empty() && !arg_patterns.iter().any(|p| p.is_match(args)) {
            return ValidationVerdict::deny(
                DecidingLayer::Whitelist,
                DenyCode::NotWhitelisted,
                ThreatLevel::Medium,
                format!("arguments not permitted for '{}'", executable),
            );
        }

        ValidationVerdict::allow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rangeguard_core::ToolRule;

    fn validator() -> CommandValidator {
        CommandValidator::new(&ValidatorConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_whitelisted_tool_allows() {
        let verdict = validator().validate("nmap -sS 172.25.0.10").await;
        assert!(verdict.is_allow());
    }

    #[tokio::test]
    async fn test_unknown_executable_denied() {
        let verdict = validator().validate("metasploit-pro run").await;
        assert_eq!(verdict.code, Some(DenyCode::NotWhitelisted));
        assert_eq!(verdict.layer, Some(DecidingLayer::Whitelist));
    }

    #[tokio::test]
    async fn test_destructive_command_is_dangerous_pattern() {
        let verdict = validator().validate("rm -rf /").await;
        assert_eq!(verdict.code, Some(DenyCode::DangerousPattern));
        assert_eq!(verdict.threat_level, ThreatLevel::High);
    }

    #[tokio::test]
    async fn test_deny_pattern_beats_whitelist() {
        // cat is whitelisted but command substitution is not
        let verdict = validator().validate("cat $(find / -name shadow)").await;
        assert_eq!(verdict.code, Some(DenyCode::DangerousPattern));
    }

    #[tokio::test]
    async fn test_empty_command_denied() {
        let verdict = validator().validate("   ").await;
        assert_eq!(verdict.code, Some(DenyCode::NotWhitelisted));
    }

    #[tokio::test]
    async fn test_arg_patterns_gate_arguments() {
        let config = ValidatorConfig {
            tools: vec![ToolRule {
                name: "nmap".to_string(),
                arg_patterns: vec![r"^-s[ST]\s+172\.25\.".to_string()],
            }],
            deny_patterns: vec![],
        };
        let validator = CommandValidator::new(&config).unwrap();

        assert!(validator.validate("nmap -sS 172.25.0.10").await.is_allow());

        let verdict = validator.validate("nmap -sS 10.0.0.1").await;
        assert_eq!(verdict.code, Some(DenyCode::NotWhitelisted));
    }

    #[tokio::test]
    async fn test_reload_swaps_snapshot() {
        let validator = validator();
        assert!(validator.validate("nmap -sn 172.25.0.0/24").await.is_allow());

        let narrowed = ValidatorConfig {
            tools: vec![ToolRule::any_args("ping")],
            deny_patterns: vec![],
        };
        validator.reload(&narrowed).await.unwrap();

        assert!(!validator.validate("nmap -sn 172.25.0.0/24").await.is_allow());
        assert!(validator.validate("ping 172.25.0.1").await.is_allow());
    }

    #[tokio::test]
    async fn test_invalid_pattern_rejected_at_compile() {
        let config = ValidatorConfig {
            tools: vec![],
            deny_patterns: vec!["(".to_string()],
        };
        assert!(CommandValidator::new(&config).is_err());
    }
}
