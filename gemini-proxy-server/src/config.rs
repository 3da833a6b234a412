use anyhow::{bail, Context};
use std::env;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Process-wide configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub api_key: String,
    pub log_level: String,
    pub base_url: String,
    /// Extra sentinel phrases for the patch prompt detector.
    pub patch_markers: Vec<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let api_key = match lookup("GENAI_API_KEY") {
            Some(key) if !key.trim().is_empty() => key.trim().to_string(),
            _ => bail!(
                "GENAI_API_KEY not found. Please set it in the environment or your .env file"
            ),
        };

        let port = match lookup("PORT") {
            Some(port) => port
                .trim()
                .parse()
                .with_context(|| format!("PORT must be a valid port number, got {port:?}"))?,
            None => 11434,
        };

        let patch_markers = lookup("PATCH_MARKERS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|marker| !marker.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Config {
            host: lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port,
            api_key,
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            base_url: lookup("GENAI_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            patch_markers,
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The tail of the API key, safe to put in logs.
    pub fn api_key_hint(&self) -> String {
        let chars: Vec<char> = self.api_key.chars().collect();
        let tail = chars.len().saturating_sub(7);
        chars[tail..].iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_only_key_is_set() {
        let config =
            Config::from_lookup(lookup(&[("GENAI_API_KEY", "AIzaSy-secret-1234567")])).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 11434);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert!(config.patch_markers.is_empty());
        assert_eq!(config.bind_address(), "0.0.0.0:11434");
        assert_eq!(config.api_key_hint(), "1234567");
    }

    #[test]
    fn missing_or_blank_key_is_fatal() {
        assert!(Config::from_lookup(lookup(&[])).is_err());
        assert!(Config::from_lookup(lookup(&[("GENAI_API_KEY", "   ")])).is_err());
    }

    #[test]
    fn invalid_port_is_rejected() {
        let result = Config::from_lookup(lookup(&[("GENAI_API_KEY", "k"), ("PORT", "eleven")]));
        assert!(result.is_err());
    }

    #[test]
    fn overrides_are_honoured() {
        let config = Config::from_lookup(lookup(&[
            ("GENAI_API_KEY", "k"),
            ("HOST", "127.0.0.1"),
            ("PORT", "8080"),
            ("LOG_LEVEL", "debug"),
            ("GENAI_BASE_URL", "http://localhost:9999/v1beta/"),
            ("PATCH_MARKERS", "apply edits, ,<<<EDIT"),
        ]))
        .unwrap();
        assert_eq!(config.bind_address(), "127.0.0.1:8080");
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.base_url, "http://localhost:9999/v1beta");
        assert_eq!(config.patch_markers, vec!["apply edits", "<<<EDIT"]);
        assert_eq!(config.api_key_hint(), "k");
    }
}
