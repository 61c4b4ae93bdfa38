// src/config/limits.rs
// Rate limit configuration hierarchy: global -> provider -> model

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::warn;

const RATE_LIMIT_FIELDS: [&str; 7] = [
    "requests_per_minute",
    "requests_per_hour",
    "requests_per_day",
    "tokens_per_minute",
    "tokens_per_hour",
    "tokens_per_day",
    "burst_size",
];

/// Per-scope rate limit values. `None` means "inherit from the parent
/// scope"; `Some(0)` means "deny".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_minute: Option<u64>,
    pub requests_per_hour: Option<u64>,
    pub requests_per_day: Option<u64>,
    pub tokens_per_minute: Option<u64>,
    pub tokens_per_hour: Option<u64>,
    pub tokens_per_day: Option<u64>,
    pub burst_size: Option<u64>,
}

impl RateLimitConfig {
    pub fn has_any_limit(&self) -> bool {
        self.requests_per_minute.is_some()
            || self.requests_per_hour.is_some()
            || self.requests_per_day.is_some()
            || self.tokens_per_minute.is_some()
            || self.tokens_per_hour.is_some()
            || self.tokens_per_day.is_some()
    }

    /// Clamp burst to requests_per_minute when both are set.
    pub fn sanitized(mut self) -> Self {
        if let (Some(rpm), Some(burst)) = (self.requests_per_minute, self.burst_size) {
            self.burst_size = Some(burst.min(rpm));
        }
        self
    }

    /// Overlay `other` on top of self: any field `other` sets wins.
    fn merged_with(&self, other: &RateLimitConfig) -> Self {
        Self {
            requests_per_minute: other.requests_per_minute.or(self.requests_per_minute),
            requests_per_hour: other.requests_per_hour.or(self.requests_per_hour),
            requests_per_day: other.requests_per_day.or(self.requests_per_day),
            tokens_per_minute: other.tokens_per_minute.or(self.tokens_per_minute),
            tokens_per_hour: other.tokens_per_hour.or(self.tokens_per_hour),
            tokens_per_day: other.tokens_per_day.or(self.tokens_per_day),
            burst_size: other.burst_size.or(self.burst_size),
        }
    }

    fn field(&self, name: &str) -> Option<u64> {
        match name {
            "requests_per_minute" => self.requests_per_minute,
            "requests_per_hour" => self.requests_per_hour,
            "requests_per_day" => self.requests_per_day,
            "tokens_per_minute" => self.tokens_per_minute,
            "tokens_per_hour" => self.tokens_per_hour,
            "tokens_per_day" => self.tokens_per_day,
            "burst_size" => self.burst_size,
            _ => None,
        }
    }
}

/// Where a configured limit value came from, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitSource {
    Env,
    File,
    Default,
}

/// Identifies a rate-limit scope: model, provider, or global.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScopeKey {
    Model { provider: String, model: String },
    Provider(String),
    Global,
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeKey::Model { provider, model } => write!(f, "{provider}:{model}"),
            ScopeKey::Provider(provider) => write!(f, "{provider}"),
            ScopeKey::Global => write!(f, "global"),
        }
    }
}

/// Resolves effective rate limit configuration per scope.
///
/// Precedence within a scope: persisted override, then environment, then
/// defaults. Across scopes the limiter checks model, provider, and global
/// configs independently (most specific first), so a looser model limit
/// never bypasses a tighter global one.
pub struct RateLimitSettings {
    global_default: RwLock<RateLimitConfig>,
    provider_overrides: RwLock<HashMap<String, RateLimitConfig>>,
    model_overrides: RwLock<HashMap<(String, String), RateLimitConfig>>,
    sources: RwLock<HashMap<String, HashMap<String, LimitSource>>>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitSettings {
    pub fn new() -> Self {
        Self {
            global_default: RwLock::new(RateLimitConfig::default()),
            provider_overrides: RwLock::new(HashMap::new()),
            model_overrides: RwLock::new(HashMap::new()),
            sources: RwLock::new(HashMap::new()),
        }
    }

    /// Effective config for a scope, deep-merged `global ⊕ provider ⊕ model`
    /// with the most specific layer winning per field.
    pub fn effective_config(&self, provider: Option<&str>, model: Option<&str>) -> RateLimitConfig {
        let mut merged = self.global_config();

        if let Some(provider) = provider {
            merged = merged.merged_with(&self.provider_config(provider));
            if let Some(model) = model {
                merged = merged.merged_with(&self.model_config(provider, model));
            }
        }

        merged.sanitized()
    }

    /// Ordered list of scopes the limiter must check for a call, skipping
    /// scopes whose effective config carries no limits.
    pub fn scopes_to_check(&self, provider: &str, model: &str) -> Vec<(ScopeKey, RateLimitConfig)> {
        let mut scopes = Vec::with_capacity(3);

        let model_config = self.effective_config(Some(provider), Some(model));
        if model_config.has_any_limit() {
            scopes.push((
                ScopeKey::Model {
                    provider: provider.to_string(),
                    model: model.to_string(),
                },
                model_config,
            ));
        }

        let provider_config = self.effective_config(Some(provider), None);
        if provider_config.has_any_limit() {
            scopes.push((ScopeKey::Provider(provider.to_string()), provider_config));
        }

        let global_config = self.effective_config(None, None);
        if global_config.has_any_limit() {
            scopes.push((ScopeKey::Global, global_config));
        }

        scopes
    }

    /// Set or clear a persisted override. Passing an all-`None` config
    /// removes the override. With `check_env_conflicts`, refuses to shadow
    /// values pinned by the environment.
    pub fn set_override(
        &self,
        provider: Option<&str>,
        model: Option<&str>,
        limits: RateLimitConfig,
        check_env_conflicts: bool,
    ) -> Result<RateLimitConfig, String> {
        let limits = limits.sanitized();
        let has_limit = RATE_LIMIT_FIELDS.iter().any(|f| limits.field(f).is_some());

        if check_env_conflicts && has_limit {
            let sources = self.sources(provider, model);
            let conflicts: Vec<&str> = RATE_LIMIT_FIELDS
                .iter()
                .filter(|f| {
                    sources.get(**f) == Some(&LimitSource::Env) && limits.field(f).is_some()
                })
                .copied()
                .collect();
            if !conflicts.is_empty() {
                return Err(format!(
                    "Cannot override environment-pinned fields: {}",
                    conflicts.join(", ")
                ));
            }
        }

        match (provider, model) {
            (Some(provider), Some(model)) => {
                let key = (provider.to_string(), model.to_string());
                let mut overrides = self.model_overrides.write();
                if has_limit {
                    overrides.insert(key, limits.clone());
                } else {
                    overrides.remove(&key);
                }
            }
            (Some(provider), None) => {
                let mut overrides = self.provider_overrides.write();
                if has_limit {
                    overrides.insert(provider.to_string(), limits.clone());
                } else {
                    overrides.remove(provider);
                }
            }
            _ => {
                *self.global_default.write() = if has_limit {
                    limits.clone()
                } else {
                    RateLimitConfig::default()
                };
            }
        }

        if has_limit {
            let scope_key = scope_label(provider, model);
            let mut sources = self.sources.write();
            let entry = sources.entry(scope_key).or_default();
            for field in RATE_LIMIT_FIELDS {
                if limits.field(field).is_some()
                    && entry.get(field).copied() != Some(LimitSource::Env)
                {
                    entry.insert(field.to_string(), LimitSource::File);
                }
            }
        }

        Ok(self.effective_config(provider, model))
    }

    /// Source of each configured field for a scope.
    pub fn sources(&self, provider: Option<&str>, model: Option<&str>) -> HashMap<String, LimitSource> {
        self.sources
            .read()
            .get(&scope_label(provider, model))
            .cloned()
            .unwrap_or_default()
    }

    fn global_config(&self) -> RateLimitConfig {
        let env = RateLimitConfig {
            requests_per_minute: env_limit("ATLAS_RATE_LIMIT_REQUESTS_PER_MINUTE"),
            requests_per_hour: env_limit("ATLAS_RATE_LIMIT_REQUESTS_PER_HOUR"),
            requests_per_day: env_limit("ATLAS_RATE_LIMIT_REQUESTS_PER_DAY"),
            tokens_per_minute: env_limit("ATLAS_RATE_LIMIT_TOKENS_PER_MINUTE"),
            tokens_per_hour: env_limit("ATLAS_RATE_LIMIT_TOKENS_PER_HOUR"),
            tokens_per_day: env_limit("ATLAS_RATE_LIMIT_TOKENS_PER_DAY"),
            burst_size: env_limit("ATLAS_RATE_LIMIT_BURST_SIZE"),
        };

        self.record_env_sources(None, None, &env);
        self.global_default.read().merged_with(&env).sanitized()
    }

    fn provider_config(&self, provider: &str) -> RateLimitConfig {
        let persisted = self
            .provider_overrides
            .read()
            .get(provider)
            .cloned()
            .unwrap_or_default();
        let env = json_env_limits(&format!("ATLAS_PROVIDER_OPTIONS_{}", env_slug(provider)));
        self.record_env_sources(Some(provider), None, &env);
        persisted.merged_with(&env)
    }

    fn model_config(&self, provider: &str, model: &str) -> RateLimitConfig {
        let persisted = self
            .model_overrides
            .read()
            .get(&(provider.to_string(), model.to_string()))
            .cloned()
            .unwrap_or_default();
        let env = json_env_limits(&format!(
            "ATLAS_MODEL_OPTIONS_{}_{}",
            env_slug(provider),
            env_slug(model)
        ));
        self.record_env_sources(Some(provider), Some(model), &env);
        persisted.merged_with(&env)
    }

    fn record_env_sources(
        &self,
        provider: Option<&str>,
        model: Option<&str>,
        env: &RateLimitConfig,
    ) {
        let mut sources = self.sources.write();
        let entry = sources.entry(scope_label(provider, model)).or_default();
        for field in RATE_LIMIT_FIELDS {
            let source = if env.field(field).is_some() {
                LimitSource::Env
            } else {
                LimitSource::Default
            };
            // Env always wins the ledger; File entries survive unless env is set
            if source == LimitSource::Env || !entry.contains_key(field) {
                entry.insert(field.to_string(), source);
            }
        }
    }
}

fn scope_label(provider: Option<&str>, model: Option<&str>) -> String {
    match (provider, model) {
        (Some(p), Some(m)) => format!("model:{p}:{m}"),
        (Some(p), None) => format!("provider:{p}"),
        _ => "global".to_string(),
    }
}

/// Transform provider/model ids into env-safe tokens.
fn env_slug(value: &str) -> String {
    value
        .to_uppercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}

fn env_limit(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Parse a `{"rate_limit": {...}}` JSON blob from an env var.
fn json_env_limits(key: &str) -> RateLimitConfig {
    let Ok(raw) = std::env::var(key) else {
        return RateLimitConfig::default();
    };
    match serde_json::from_str::<serde_json::Value>(&raw) {
        Ok(value) => value
            .get("rate_limit")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default(),
        Err(e) => {
            warn!("Failed to decode JSON for {}: {}", key, e);
            RateLimitConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_overrides_win_over_provider_and_global() {
        let settings = RateLimitSettings::new();
        settings
            .set_override(
                None,
                None,
                RateLimitConfig {
                    requests_per_minute: Some(10),
                    tokens_per_minute: Some(1_000),
                    ..Default::default()
                },
                false,
            )
            .unwrap();
        settings
            .set_override(
                Some("openrouter"),
                None,
                RateLimitConfig {
                    requests_per_minute: Some(5),
                    ..Default::default()
                },
                false,
            )
            .unwrap();
        settings
            .set_override(
                Some("openrouter"),
                Some("fast-model"),
                RateLimitConfig {
                    requests_per_minute: Some(2),
                    ..Default::default()
                },
                false,
            )
            .unwrap();

        let effective = settings.effective_config(Some("openrouter"), Some("fast-model"));
        assert_eq!(effective.requests_per_minute, Some(2));
        // Unset at model and provider level, inherited from global
        assert_eq!(effective.tokens_per_minute, Some(1_000));

        let provider_level = settings.effective_config(Some("openrouter"), None);
        assert_eq!(provider_level.requests_per_minute, Some(5));
    }

    #[test]
    fn burst_is_clamped_to_rpm() {
        let config = RateLimitConfig {
            requests_per_minute: Some(10),
            burst_size: Some(50),
            ..Default::default()
        }
        .sanitized();
        assert_eq!(config.burst_size, Some(10));
    }

    #[test]
    fn scopes_skip_unlimited_layers() {
        let settings = RateLimitSettings::new();
        settings
            .set_override(
                Some("openrouter"),
                Some("m"),
                RateLimitConfig {
                    requests_per_minute: Some(3),
                    ..Default::default()
                },
                false,
            )
            .unwrap();

        let scopes = settings.scopes_to_check("openrouter", "m");
        // Model scope inherits into provider/global checks only when those
        // layers define limits of their own; here only the model layer does,
        // but provider and global inherit the same merged view upward.
        assert!(scopes
            .iter()
            .any(|(key, _)| matches!(key, ScopeKey::Model { .. })));
        assert!(!scopes.iter().any(|(key, _)| matches!(key, ScopeKey::Global)));
    }

    #[test]
    fn clearing_override_restores_inheritance() {
        let settings = RateLimitSettings::new();
        settings
            .set_override(
                Some("groq"),
                None,
                RateLimitConfig {
                    requests_per_hour: Some(100),
                    ..Default::default()
                },
                false,
            )
            .unwrap();
        assert_eq!(
            settings
                .effective_config(Some("groq"), None)
                .requests_per_hour,
            Some(100)
        );

        settings
            .set_override(Some("groq"), None, RateLimitConfig::default(), false)
            .unwrap();
        assert_eq!(
            settings
                .effective_config(Some("groq"), None)
                .requests_per_hour,
            None
        );
    }
}
