//! Operator configuration.

use std::env;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use zkrollup_state::{Blake3Backend, ProvingContext, ACCOUNT_DB_DEPTH};

/// Operator configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorConfig {
    /// Depth of the account accumulator.
    pub account_db_depth: u8,
    /// Hex seed for the proving key. A random key is used when absent.
    pub proving_seed: Option<String>,
    /// Capacity of the operator command channel.
    pub command_buffer: usize,
    /// HTTP listen address.
    pub listen_addr: String,
    /// Enable CORS.
    pub enable_cors: bool,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            account_db_depth: ACCOUNT_DB_DEPTH,
            proving_seed: None,
            command_buffer: 64,
            listen_addr: "0.0.0.0:3002".into(),
            enable_cors: true,
        }
    }
}

impl OperatorConfig {
    /// Load configuration from environment variables (and `.env`, if present).
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build a configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let account_db_depth = match lookup("ZKROLLUP_DEPTH") {
            Some(s) => s
                .trim()
                .parse()
                .with_context(|| format!("ZKROLLUP_DEPTH must be an integer, got {s:?}"))?,
            None => defaults.account_db_depth,
        };

        let proving_seed = lookup("ZKROLLUP_PROVING_SEED").filter(|s| !s.trim().is_empty());
        if let Some(seed) = &proving_seed {
            decode_seed(seed).context("ZKROLLUP_PROVING_SEED must be hex")?;
        }

        let command_buffer = match lookup("ZKROLLUP_COMMAND_BUFFER") {
            Some(s) => s
                .trim()
                .parse()
                .with_context(|| format!("ZKROLLUP_COMMAND_BUFFER must be an integer, got {s:?}"))?,
            None => defaults.command_buffer,
        };
        if command_buffer == 0 {
            anyhow::bail!("ZKROLLUP_COMMAND_BUFFER must be positive");
        }

        let listen_addr = lookup("ZKROLLUP_LISTEN_ADDR").unwrap_or(defaults.listen_addr);

        let enable_cors = lookup("ZKROLLUP_ENABLE_CORS")
            .map(|s| s.to_lowercase() != "false" && s != "0")
            .unwrap_or(defaults.enable_cors);

        Ok(Self {
            account_db_depth,
            proving_seed,
            command_buffer,
            listen_addr,
            enable_cors,
        })
    }

    /// Proving context for this configuration.
    pub fn proving_context(&self) -> Result<ProvingContext> {
        let backend = match &self.proving_seed {
            Some(seed) => Blake3Backend::from_seed(&decode_seed(seed)?),
            None => {
                tracing::warn!("no proving seed configured, proofs will not verify across restarts");
                Blake3Backend::random()
            }
        };
        Ok(ProvingContext::new(backend))
    }
}

fn decode_seed(seed: &str) -> Result<Vec<u8>> {
    let seed = seed.trim();
    let bytes = hex::decode(seed.strip_prefix("0x").unwrap_or(seed))?;
    if bytes.is_empty() {
        anyhow::bail!("proving seed is empty");
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use zkrollup_state::{process_deposit, AccountDb, Deposit, PendingDepositStack, PublicKey};

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = OperatorConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, OperatorConfig::default());
        assert_eq!(config.account_db_depth, 32);
    }

    #[test]
    fn variables_override_defaults() {
        let config = OperatorConfig::from_lookup(lookup(&[
            ("ZKROLLUP_DEPTH", "20"),
            ("ZKROLLUP_PROVING_SEED", "0xdeadbeef"),
            ("ZKROLLUP_COMMAND_BUFFER", "8"),
            ("ZKROLLUP_LISTEN_ADDR", "127.0.0.1:9000"),
            ("ZKROLLUP_ENABLE_CORS", "false"),
        ]))
        .unwrap();

        assert_eq!(config.account_db_depth, 20);
        assert_eq!(config.proving_seed.as_deref(), Some("0xdeadbeef"));
        assert_eq!(config.command_buffer, 8);
        assert_eq!(config.listen_addr, "127.0.0.1:9000");
        assert!(!config.enable_cors);
    }

    #[test]
    fn invalid_values_are_reported() {
        assert!(OperatorConfig::from_lookup(lookup(&[("ZKROLLUP_DEPTH", "deep")])).is_err());
        assert!(OperatorConfig::from_lookup(lookup(&[("ZKROLLUP_PROVING_SEED", "xyz")])).is_err());
        assert!(OperatorConfig::from_lookup(lookup(&[("ZKROLLUP_COMMAND_BUFFER", "0")])).is_err());
    }

    #[test]
    fn same_seed_gives_compatible_contexts() {
        let config = OperatorConfig {
            proving_seed: Some("0102".into()),
            ..OperatorConfig::default()
        };
        let a = config.proving_context().unwrap();
        let b = config.proving_context().unwrap();

        let mut queue = PendingDepositStack::new();
        let mut db = AccountDb::new(config.account_db_depth).unwrap();
        queue.push(Deposit::new(PublicKey::from_bytes([1; 32]), 1));
        let proof = process_deposit(&a, &mut queue, &mut db).unwrap();

        assert!(proof.verify(&b).is_ok());
    }
}
