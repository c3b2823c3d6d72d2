//! Executor roles and their legacy owner aliases.

use serde::{Deserialize, Serialize};

/// The two executor classes a chunk can be routed to.
///
/// Task declarations and older dispatch files name the executor by owner
/// (`claude`, `codex`) instead of by role; every parse goes through
/// [`Role::from_alias`] so the splitter, dispatcher and implement stage agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[serde(alias = "claude")]
    Architect,
    #[default]
    #[serde(alias = "codex")]
    Builder,
}

impl Role {
    /// Parse a role name or owner alias (case-insensitive).
    pub fn from_alias(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "architect" | "claude" => Some(Role::Architect),
            "builder" | "codex" => Some(Role::Builder),
            _ => None,
        }
    }

    /// Resolve a role from an explicit `role` field and an `owner` field.
    ///
    /// The role field wins when it parses; otherwise the owner alias is used;
    /// otherwise the chunk goes to the builder.
    pub fn resolve(role: Option<&str>, owner: Option<&str>) -> Self {
        role.and_then(Self::from_alias)
            .or_else(|| owner.and_then(Self::from_alias))
            .unwrap_or_default()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Architect => "architect",
            Role::Builder => "builder",
        }
    }

    /// Owner name recorded in dispatch manifests and result files.
    pub fn owner(&self) -> &'static str {
        match self {
            Role::Architect => "claude",
            Role::Builder => "codex",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_alias(s).ok_or_else(|| {
            anyhow::anyhow!(
                "Invalid role '{}'. Valid values: architect, builder (aliases: claude, codex)",
                s
            )
        })
    }
}
