use std::collections::HashMap;
use std::env;

use dotenv::dotenv;
use serde_json::Value;

use crate::config::ConfigProvider;

/// Configuration from process environment variables.
///
/// Dotted keys map to upper snake case: `amqp.maxConnectionRetries` is read
/// from `AMQP_MAX_CONNECTION_RETRIES`. Values that parse as JSON are taken
/// as JSON, anything else as a plain string. Typed lookups still accept a
/// bare number or boolean where a string is expected.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    vars: HashMap<String, String>,
}

impl EnvConfig {
    /// Snapshot of the environment after applying any `.env` file.
    pub fn load() -> Self {
        dotenv().ok();
        Self::from_vars(env::vars())
    }

    pub fn from_vars<K, V>(vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: vars
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }
}

pub fn env_key(key: &str) -> String {
    let mut name = String::with_capacity(key.len() + 4);
    let mut previous_lower = false;
    for ch in key.chars() {
        match ch {
            '.' | '-' => {
                name.push('_');
                previous_lower = false;
            }
            ch if ch.is_ascii_uppercase() && previous_lower => {
                name.push('_');
                name.push(ch);
                previous_lower = false;
            }
            ch => {
                name.push(ch.to_ascii_uppercase());
                previous_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
            }
        }
    }
    name
}

impl ConfigProvider for EnvConfig {
    fn value(&self, key: &str) -> Option<Value> {
        let raw = self.vars.get(&env_key(key))?;
        Some(serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone())))
    }
}
