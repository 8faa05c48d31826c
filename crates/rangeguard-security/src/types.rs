//! Verdict vocabulary shared by the validation layers

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Security layer errors (rule compilation, signature parsing).
#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Deny,
}

/// Which mediation layer produced a deny verdict. Layers run in a fixed
/// order and short-circuit on the first deny.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecidingLayer {
    RateLimit,
    Pattern,
    Whitelist,
    Breakout,
    Lifecycle,
}

/// Stable deny reason codes; these appear verbatim in API responses and
/// audit records.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenyCode {
    NotWhitelisted,
    DangerousPattern,
    RateLimitExceeded,
    BreakoutDetected,
    ContainerQuarantined,
}

impl DenyCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyCode::NotWhitelisted => "NOT_WHITELISTED",
            DenyCode::DangerousPattern => "DANGEROUS_PATTERN",
            DenyCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            DenyCode::BreakoutDetected => "BREAKOUT_DETECTED",
            DenyCode::ContainerQuarantined => "CONTAINER_QUARANTINED",
        }
    }
}

/// Outcome of one validation layer. A deny from any layer is final.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationVerdict {
    pub decision: Decision,
    pub layer: Option<DecidingLayer>,
    pub code: Option<DenyCode>,
    pub threat_level: ThreatLevel,
    pub reason: String,
}

impl ValidationVerdict {
    pub fn allow() -> Self {
        Self {
            decision: Decision::Allow,
            layer: None,
            code: None,
            threat_level: ThreatLevel::Low,
            reason: "allowed".to_string(),
        }
    }

    pub fn deny(
        layer: DecidingLayer,
        code: DenyCode,
        threat_level: ThreatLevel,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            decision: Decision::Deny,
            layer: Some(layer),
            code: Some(code),
            threat_level,
            reason: reason.into(),
        }
    }

    pub fn is_allow(&self) -> bool {
        self.decision == Decision::Allow
    }

    /// Verdict code as recorded in the audit log.
    pub fn code_str(&self) -> &'static str {
        match self.code {
            Some(code) => code.as_str(),
            None => "ALLOW",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threat_level_ordering() {
        assert!(ThreatLevel::Low < ThreatLevel::Medium);
        assert!(ThreatLevel::Medium < ThreatLevel::High);
        assert!(ThreatLevel::High < ThreatLevel::Critical);
    }

    #[test]
    fn test_verdict_codes() {
        assert_eq!(ValidationVerdict::allow().code_str(), "ALLOW");
        let deny = ValidationVerdict::deny(
            DecidingLayer::Whitelist,
            DenyCode::NotWhitelisted,
            ThreatLevel::Medium,
            "unknown tool",
        );
        assert_eq!(deny.code_str(), "NOT_WHITELISTED");
        assert!(!deny.is_allow());
    }
}
