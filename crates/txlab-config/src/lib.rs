#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use txlab_domain::{
    ensure_non_empty, hash_json, IsolationLevel, LabConfig, NormalizedLabConfig, ScenarioKind,
    SeedConfig, CONFIG_VERSION,
};

/// Accounts every scenario script touches.
const REQUIRED_ACCOUNTS: [&str; 2] = ["A", "B"];

/// Account the phantom-read scenario inserts; it must not exist beforehand.
const PHANTOM_INSERT_ACCOUNT: &str = "D";

/// Load lab configuration YAML from disk and normalize it.
///
/// # Errors
/// Returns an error when the file cannot be read, parsed, or validated.
pub fn load_config_from_path(path: &Path) -> Result<NormalizedLabConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    normalize_config_yaml(&content)
}

/// Parse lab configuration YAML into its validated, normalized form.
///
/// # Errors
/// Returns an error when YAML parsing or validation fails.
pub fn normalize_config_yaml(yaml: &str) -> Result<NormalizedLabConfig> {
    let config: LabConfig =
        serde_yaml::from_str(yaml).map_err(|err| anyhow!("invalid config YAML structure: {err}"))?;
    normalize_config(config)
}

/// Configuration used when no file is given.
///
/// # Errors
/// Returns an error only if the defaults cannot be serialized for hashing.
pub fn default_config() -> Result<NormalizedLabConfig> {
    normalize_config(LabConfig::default())
}

/// Validate a parsed configuration, type its overrides and fingerprint it.
///
/// # Errors
/// Returns an error on an unsupported version, bad seed, or unknown scenario or
/// isolation names.
pub fn normalize_config(config: LabConfig) -> Result<NormalizedLabConfig> {
    if config.config_version != CONFIG_VERSION {
        return Err(anyhow!(
            "unsupported config_version {}; expected {CONFIG_VERSION}",
            config.config_version
        ));
    }

    let seed = normalize_seed(&config.seed)?;
    validate_seed(&seed)?;

    let mut isolation_overrides = BTreeMap::new();
    for (scenario, level) in &config.isolation_overrides {
        let kind = ScenarioKind::parse(&scenario.trim().replace('-', "_"))?;
        let level = IsolationLevel::parse(level)?;
        if isolation_overrides.insert(kind, level).is_some() {
            return Err(anyhow!("duplicate isolation override for {kind}"));
        }
    }

    let override_names: BTreeMap<&str, &str> = isolation_overrides
        .iter()
        .map(|(kind, level)| (kind.as_str(), level.as_str()))
        .collect();
    let normalized_json = serde_json::json!({
        "config_version": CONFIG_VERSION,
        "pacing": config.pacing,
        "isolation_overrides": override_names,
        "seed": seed,
        "detector": config.detector,
        "trace_db": config.trace_db,
    });
    let normalized_hash = hash_json(&normalized_json)?;

    Ok(NormalizedLabConfig {
        normalized_hash,
        pacing: config.pacing,
        isolation_overrides,
        seed,
        detector: config.detector,
        trace_db: config.trace_db,
    })
}

fn normalize_seed(seed: &SeedConfig) -> Result<SeedConfig> {
    Ok(SeedConfig {
        accounts: trim_keys("seed.accounts", &seed.accounts)?,
        phantom_extra: trim_keys("seed.phantom_extra", &seed.phantom_extra)?,
    })
}

fn trim_keys(field_name: &str, rows: &BTreeMap<String, i64>) -> Result<BTreeMap<String, i64>> {
    let mut out = BTreeMap::new();
    for (account, balance) in rows {
        ensure_non_empty(field_name, account)?;
        if out.insert(account.trim().to_string(), *balance).is_some() {
            return Err(anyhow!("{field_name} lists account {} twice", account.trim()));
        }
    }
    Ok(out)
}

fn validate_seed(seed: &SeedConfig) -> Result<()> {
    for account in REQUIRED_ACCOUNTS {
        if !seed.accounts.contains_key(account) {
            return Err(anyhow!("seed.accounts must include account {account}"));
        }
    }

    let accounts: BTreeSet<&str> = seed.accounts.keys().map(String::as_str).collect();
    for account in seed.phantom_extra.keys() {
        if accounts.contains(account.as_str()) {
            return Err(anyhow!(
                "seed.phantom_extra account {account} is already in seed.accounts"
            ));
        }
    }
    if accounts.contains(PHANTOM_INSERT_ACCOUNT)
        || seed.phantom_extra.contains_key(PHANTOM_INSERT_ACCOUNT)
    {
        return Err(anyhow!(
            "account {PHANTOM_INSERT_ACCOUNT} is reserved for the phantom_read insert"
        ));
    }
    Ok(())
}
