#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use planwise_domain::{ensure_non_empty, hash_bytes, hash_json, ResearchProfile};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

pub const PROVIDER_NAMES: &[&str] = &["openai", "anthropic", "mock"];
pub const SEARCH_BACKEND_NAMES: &[&str] = &["serper", "duckduckgo", "wikipedia"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProfileEnvelope {
    pub source_hash: String,
    pub profile_hash: String,
    pub profile: ResearchProfile,
    pub profile_json: Value,
}

/// Load a run profile YAML file and normalize it.
///
/// # Errors
/// Returns an error when the file cannot be read, parsed, or validated.
pub fn load_profile_from_path(path: &Path) -> Result<ProfileEnvelope> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read profile {}", path.display()))?;
    parse_profile_yaml(&content)
}

/// Parse profile YAML into a validated, normalized and hashed envelope.
///
/// # Errors
/// Returns an error when YAML parsing or validation fails.
pub fn parse_profile_yaml(yaml: &str) -> Result<ProfileEnvelope> {
    let source_hash = hash_bytes(yaml.as_bytes());
    let profile: ResearchProfile =
        serde_yaml::from_str(yaml).map_err(|err| anyhow!("invalid profile YAML structure: {err}"))?;
    finalize_profile(profile, source_hash)
}

/// Built-in profile used when no file is given.
///
/// # Errors
/// Returns an error only if the defaults fail validation.
pub fn default_profile() -> Result<ProfileEnvelope> {
    finalize_profile(ResearchProfile::default(), hash_bytes(b""))
}

/// Validate, normalize and re-hash a profile after any mutation.
///
/// # Errors
/// Returns an error when the profile is invalid before or after normalization.
pub fn finalize_profile(mut profile: ResearchProfile, source_hash: String) -> Result<ProfileEnvelope> {
    validate_profile(&profile)?;
    normalize_profile(&mut profile);
    validate_profile(&profile)?;

    let profile_json = serde_json::to_value(&profile)?;
    let profile_hash = hash_json(&profile_json)?;
    Ok(ProfileEnvelope {
        source_hash,
        profile_hash,
        profile,
        profile_json,
    })
}

/// Overlay `LLM_PROVIDER`, `OPENAI_MODEL`, `ANTHROPIC_MODEL`, `TRACE_TRAJECTORY`,
/// `TRACE_DIR` and `OUTPUT_DIR` onto a profile. Returns the names that were applied.
pub fn apply_env_overrides<F>(profile: &mut ResearchProfile, lookup: F) -> Vec<&'static str>
where
    F: Fn(&str) -> Option<String>,
{
    let read = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
    let mut applied = Vec::new();

    if let Some(provider) = read("LLM_PROVIDER") {
        switch_provider(profile, &provider);
        applied.push("LLM_PROVIDER");
    }
    match profile.provider.provider_name.as_str() {
        "openai" => {
            if let Some(model) = read("OPENAI_MODEL") {
                profile.provider.model_id = model.trim().to_string();
                applied.push("OPENAI_MODEL");
            }
        }
        "anthropic" => {
            if let Some(model) = read("ANTHROPIC_MODEL") {
                profile.provider.model_id = model.trim().to_string();
                applied.push("ANTHROPIC_MODEL");
            }
        }
        _ => {}
    }
    if let Some(flag) = read("TRACE_TRAJECTORY") {
        profile.trace.enabled = parse_bool_flag(&flag);
        applied.push("TRACE_TRAJECTORY");
    }
    if let Some(dir) = read("TRACE_DIR") {
        profile.trace.trace_dir = PathBuf::from(dir.trim());
        applied.push("TRACE_DIR");
    }
    if let Some(dir) = read("OUTPUT_DIR") {
        profile.tools.output_dir = PathBuf::from(dir.trim());
        applied.push("OUTPUT_DIR");
    }

    if !applied.is_empty() {
        debug!(applied = ?applied, "environment overrides applied to profile");
    }
    applied
}

/// Point the profile at another provider, resetting model and key variable
/// when the provider actually changes.
pub fn switch_provider(profile: &mut ResearchProfile, provider_name: &str) {
    let provider_name = provider_name.trim().to_ascii_lowercase();
    if profile.provider.provider_name == provider_name {
        return;
    }
    profile.provider.model_id = default_model_for(&provider_name).to_string();
    profile.provider.api_key_env = default_api_key_env(&provider_name).map(str::to_string);
    profile.provider.base_url = None;
    profile.provider.provider_name = provider_name;
}

/// `false` for `0`, `false`, `no`, `off` (any case); `true` otherwise.
#[must_use]
pub fn parse_bool_flag(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "no" | "off"
    )
}

#[must_use]
pub fn default_model_for(provider_name: &str) -> &'static str {
    match provider_name {
        "anthropic" => "claude-3-5-sonnet-latest",
        "mock" => "mock-planner-v1",
        _ => "gpt-4.1-mini",
    }
}

#[must_use]
pub fn default_api_key_env(provider_name: &str) -> Option<&'static str> {
    match provider_name {
        "openai" => Some("OPENAI_API_KEY"),
        "anthropic" => Some("ANTHROPIC_API_KEY"),
        _ => None,
    }
}

fn validate_profile(profile: &ResearchProfile) -> Result<()> {
    ensure_non_empty("profile_name", &profile.profile_name)?;

    let provider = &profile.provider;
    ensure_non_empty("provider_name", &provider.provider_name)?;
    ensure_non_empty("model_id", &provider.model_id)?;
    let provider_name = provider.provider_name.trim().to_ascii_lowercase();
    if !PROVIDER_NAMES.contains(&provider_name.as_str()) {
        return Err(anyhow!(
            "unsupported provider_name {}; expected one of {}",
            provider.provider_name,
            PROVIDER_NAMES.join(", ")
        ));
    }
    ensure_positive("provider.timeout_ms", provider.timeout_ms)?;
    ensure_positive("provider.max_output_tokens", u64::from(provider.max_output_tokens))?;

    let tools = &profile.tools;
    ensure_non_empty("tools.output_dir", &tools.output_dir.to_string_lossy())?;
    ensure_positive("tools.tool_timeout_ms", tools.tool_timeout_ms)?;
    ensure_positive("tools.search_timeout_ms", tools.search_timeout_ms)?;
    ensure_positive("tools.max_search_results", tools.max_search_results as u64)?;
    ensure_positive("tools.preview_max_chars", tools.preview_max_chars as u64)?;
    ensure_non_empty("tools.serper_api_key_env", &tools.serper_api_key_env)?;
    for backend in &tools.search_backends {
        let name = backend.trim().to_ascii_lowercase();
        if !SEARCH_BACKEND_NAMES.contains(&name.as_str()) {
            return Err(anyhow!(
                "unknown search backend {backend}; expected one of {}",
                SEARCH_BACKEND_NAMES.join(", ")
            ));
        }
    }

    ensure_non_empty("trace.trace_dir", &profile.trace.trace_dir.to_string_lossy())?;

    let execution = &profile.execution;
    ensure_positive("execution.max_plan_steps", execution.max_plan_steps as u64)?;
    ensure_positive(
        "execution.min_steps_for_error_rate",
        execution.min_steps_for_error_rate as u64,
    )?;
    if let Some(rate) = execution.max_tool_error_rate {
        if !(0.0..=1.0).contains(&rate) {
            return Err(anyhow!(
                "execution.max_tool_error_rate MUST be within 0.0..=1.0, got {rate}"
            ));
        }
    }
    Ok(())
}

fn ensure_positive(field_name: &str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(anyhow!("{field_name} MUST be greater than zero"));
    }
    Ok(())
}

fn normalize_profile(profile: &mut ResearchProfile) {
    profile.profile_name = profile.profile_name.trim().to_string();

    let provider = &mut profile.provider;
    provider.provider_name = provider.provider_name.trim().to_ascii_lowercase();
    provider.model_id = provider.model_id.trim().to_string();
    provider.api_key_env = provider
        .api_key_env
        .take()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .or_else(|| default_api_key_env(&provider.provider_name).map(str::to_string));
    provider.base_url = provider
        .base_url
        .take()
        .map(|url| url.trim().trim_end_matches('/').to_string())
        .filter(|url| !url.is_empty());

    let tools = &mut profile.tools;
    tools.serper_api_key_env = tools.serper_api_key_env.trim().to_string();
    let mut seen = BTreeSet::new();
    tools.search_backends = tools
        .search_backends
        .iter()
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| seen.insert(name.clone()))
        .collect();
}
