//! Discovery of provider keys from the environment.
//!
//! A provider's keys live in `<PREFIX>` and `<PREFIX>_<n>` (for example
//! `GROQ_API_KEY`, `GROQ_API_KEY_2`, `GROQ_API_KEY_3`). Slot order is the base
//! variable first, then numeric suffixes ascending. Empty values and template
//! placeholders such as `your_groq_key_here` are skipped.

use baatcheet_core::Provider;
use tracing::debug;

use crate::pool::ProviderKeys;

/// Extracts `provider`'s secrets from `(name, value)` pairs.
pub fn discover_keys<I, K, V>(provider: Provider, vars: I) -> Vec<String>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let prefix = provider.env_prefix();
    let mut found: Vec<(u32, String)> = Vec::new();

    for (name, value) in vars {
        let Some(position) = slot_position(prefix, name.as_ref()) else {
            continue;
        };
        let value = value.as_ref().trim();
        if is_placeholder(value) {
            debug!(provider = %provider, var = name.as_ref(), "skipping placeholder key");
            continue;
        }
        found.push((position, value.to_string()));
    }

    found.sort_by_key(|(position, _)| *position);

    let mut secrets: Vec<String> = Vec::with_capacity(found.len());
    for (_, secret) in found {
        if !secrets.contains(&secret) {
            secrets.push(secret);
        }
    }
    secrets
}

/// Builds pool entries for every provider from `(name, value)` pairs.
///
/// `daily_limit` may override a provider's default per-key limit.
pub fn provider_keys<I, K, V>(vars: I, daily_limit: impl Fn(Provider) -> Option<u32>) -> Vec<ProviderKeys>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let vars: Vec<(K, V)> = vars.into_iter().collect();

    Provider::ALL
        .into_iter()
        .map(|provider| {
            let secrets = discover_keys(provider, vars.iter().map(|(k, v)| (k.as_ref(), v.as_ref())));
            let keys = ProviderKeys::new(provider, secrets);
            match daily_limit(provider) {
                Some(limit) => keys.with_daily_limit(limit),
                None => keys,
            }
        })
        .collect()
}

// Base variable sorts before `_1`.
fn slot_position(prefix: &str, name: &str) -> Option<u32> {
    let rest = name.strip_prefix(prefix)?;
    if rest.is_empty() {
        return Some(0);
    }
    let suffix = rest.strip_prefix('_')?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse::<u32>().ok().map(|n| n.saturating_add(1))
}

fn is_placeholder(value: &str) -> bool {
    value.is_empty() || value.to_ascii_lowercase().starts_with("your")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_key_comes_first_then_numeric_order() {
        let vars = [
            ("GROQ_API_KEY_10", "k10"),
            ("GROQ_API_KEY_2", "k2"),
            ("GROQ_API_KEY", "base"),
            ("GROQ_API_KEY_3", "k3"),
        ];

        assert_eq!(discover_keys(Provider::Groq, vars), vec!["base", "k2", "k3", "k10"]);
    }

    #[test]
    fn placeholders_and_empty_values_are_skipped() {
        let vars = [
            ("GEMINI_API_KEY", "your_gemini_key_here"),
            ("GEMINI_API_KEY_2", "   "),
            ("GEMINI_API_KEY_3", "AIza-real"),
        ];

        assert_eq!(discover_keys(Provider::Gemini, vars), vec!["AIza-real"]);
    }

    #[test]
    fn unrelated_and_malformed_names_are_ignored() {
        let vars = [
            ("GROQ_API_KEY_BACKUP", "nope"),
            ("GROQ_API_KEYS", "nope"),
            ("OPENROUTER_API_KEY", "other"),
            ("GROQ_API_KEY_", "nope"),
            ("GROQ_API_KEY_1", "yes"),
        ];

        assert_eq!(discover_keys(Provider::Groq, vars), vec!["yes"]);
    }

    #[test]
    fn duplicate_secrets_collapse() {
        let vars = [("SERPAPI_KEY", "same"), ("SERPAPI_KEY_2", "same")];

        assert_eq!(discover_keys(Provider::SerpApi, vars), vec!["same"]);
    }

    #[test]
    fn provider_keys_covers_every_provider() {
        let vars = [("DEEPSEEK_API_KEY", "sk-1"), ("DEEPSEEK_API_KEY_2", "sk-2")];

        let keys = provider_keys(vars, |provider| (provider == Provider::DeepSeek).then_some(50));

        assert_eq!(keys.len(), Provider::ALL.len());
        let deepseek = keys.iter().find(|k| k.provider == Provider::DeepSeek).unwrap();
        assert_eq!(deepseek.secrets.len(), 2);
        assert_eq!(deepseek.daily_limit, 50);
        let groq = keys.iter().find(|k| k.provider == Provider::Groq).unwrap();
        assert!(groq.secrets.is_empty());
        assert_eq!(groq.daily_limit, Provider::Groq.default_daily_limit());
    }
}
