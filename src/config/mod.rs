//! Command-line value parsers.

mod duration;

pub use duration::parse_duration;

use anyhow::Context;

/// Parse a `key=value` librdkafka property.
pub fn parse_key_value(s: &str) -> anyhow::Result<(String, String)> {
    let (key, value) = s
        .split_once('=')
        .with_context(|| format!("Expected key=value, got '{s}'"))?;
    let key = key.trim();
    if key.is_empty() {
        anyhow::bail!("Empty property name in '{s}'");
    }
    Ok((key.to_string(), value.trim().to_string()))
}
