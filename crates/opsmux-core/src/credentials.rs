//! Credential checks performed before a provider connection is attempted.
//!
//! Each known provider id maps to the environment variable its MCP server
//! reads its token from. A provider whose variable is missing, too short or
//! still holds a template placeholder is never spawned: it goes straight to
//! `auth_failed` instead of looping through futile reconnects.

use std::sync::Arc;

use crate::config::ProviderConfig;

/// Minimum accepted token length.
pub const MIN_TOKEN_LENGTH: usize = 10;

/// Substrings that mark a value as an unfilled template.
const PLACEHOLDER_MARKERS: &[&str] = &[
    "your_",
    "your-",
    "<",
    "${",
    "placeholder",
    "changeme",
    "replace",
    "xxxx",
    "todo",
];

/// Required credential for a known provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CredentialRequirement {
    pub provider_id: &'static str,
    pub env_var: &'static str,
    pub description: &'static str,
}

/// Credentials required by the providers opsmux knows about.
pub const KNOWN_REQUIREMENTS: &[CredentialRequirement] = &[
    CredentialRequirement {
        provider_id: "github",
        env_var: "GITHUB_PERSONAL_ACCESS_TOKEN",
        description: "a GitHub personal access token with repo scope",
    },
    CredentialRequirement {
        provider_id: "gitlab",
        env_var: "GITLAB_PERSONAL_ACCESS_TOKEN",
        description: "a GitLab personal access token with api scope",
    },
    CredentialRequirement {
        provider_id: "azure",
        env_var: "AZURE_DEVOPS_PAT",
        description: "an Azure DevOps personal access token",
    },
];

/// Outcome of a credential check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialCheck {
    /// Nothing required, or the required value looks usable.
    Valid,
    /// The required variable is absent or unusable.
    Missing { env_var: String, reason: String },
}

impl CredentialCheck {
    pub fn is_valid(&self) -> bool {
        matches!(self, CredentialCheck::Valid)
    }
}

/// Predicate deciding whether a provider may be connected.
pub trait CredentialValidator: Send + Sync {
    fn validate(&self, provider_id: &str, config: &ProviderConfig) -> CredentialCheck;
}

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Validator reading the provider's configured env first, then the process env.
#[derive(Clone)]
pub struct EnvCredentialValidator {
    lookup: EnvLookup,
}

impl EnvCredentialValidator {
    /// Validator backed by the process environment.
    pub fn new() -> Self {
        Self {
            lookup: Arc::new(|key| std::env::var(key).ok()),
        }
    }

    /// Validator backed by a custom lookup (useful in tests).
    pub fn with_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            lookup: Arc::new(lookup),
        }
    }
}

impl Default for EnvCredentialValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EnvCredentialValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvCredentialValidator").finish_non_exhaustive()
    }
}

impl CredentialValidator for EnvCredentialValidator {
    fn validate(&self, provider_id: &str, config: &ProviderConfig) -> CredentialCheck {
        let Some(env_var) = required_env_var(provider_id, config) else {
            return CredentialCheck::Valid;
        };

        let value = config
            .env
            .get(&env_var)
            .cloned()
            .or_else(|| (self.lookup)(&env_var));

        match value {
            None => CredentialCheck::Missing {
                reason: format!("{} is not set", env_var),
                env_var,
            },
            Some(value) => match token_problem(&value) {
                None => CredentialCheck::Valid,
                Some(problem) => CredentialCheck::Missing {
                    reason: format!("{} {}", env_var, problem),
                    env_var,
                },
            },
        }
    }
}

/// Variable a provider needs: the explicit override, else the known default.
pub fn required_env_var(provider_id: &str, config: &ProviderConfig) -> Option<String> {
    config
        .required_env
        .clone()
        .or_else(|| requirement_for(provider_id).map(|r| r.env_var.to_string()))
}

/// Known requirement for a provider id.
pub fn requirement_for(provider_id: &str) -> Option<&'static CredentialRequirement> {
    KNOWN_REQUIREMENTS
        .iter()
        .find(|r| r.provider_id == provider_id)
}

/// Whether a value could plausibly be a real token.
pub fn is_usable_token(value: &str) -> bool {
    token_problem(value).is_none()
}

fn token_problem(value: &str) -> Option<&'static str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Some("is empty");
    }
    let lowered = trimmed.to_lowercase();
    if PLACEHOLDER_MARKERS.iter().any(|m| lowered.contains(m)) {
        return Some("still contains a placeholder value");
    }
    if trimmed.chars().count() < MIN_TOKEN_LENGTH {
        return Some("is too short to be a valid token");
    }
    None
}

/// Actionable instruction for a provider whose credentials are unusable.
pub fn remediation_hint(provider_id: &str, env_var: &str) -> String {
    match requirement_for(provider_id) {
        Some(req) if req.env_var == env_var => format!(
            "Set {} to {} in the provider's env or your shell, then reload provider '{}'",
            env_var, req.description, provider_id
        ),
        _ => format!(
            "Set {} to a valid token in the provider's env or your shell, then reload provider '{}'",
            env_var, provider_id
        ),
    }
}
