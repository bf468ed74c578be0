//! Secret redaction applied to worker output and persisted artifacts before
//! they are written to disk or returned over the HTTP API.

use once_cell::sync::Lazy;
use regex::Regex;

static ANTHROPIC_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"sk-ant-[A-Za-z0-9_-]{20,}").expect("valid regex"));

static GENERIC_SK_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"sk-[A-Za-z0-9]{20,}").expect("valid regex"));

/// Env var names whose values are always treated as sensitive when redacting
/// worker output, regardless of whether they were explicitly allowlisted for
/// forwarding into the subprocess environment.
pub const SENSITIVE_ENV_VARS: &[&str] = &[
    "ANTHROPIC_API_KEY",
    "OPENAI_API_KEY",
    "KIMI_API_KEY",
    "MOONSHOT_API_KEY",
    "GITHUB_TOKEN",
    "GH_TOKEN",
    "LOOPD_AUTH_TOKEN",
    "FLOWD_AUTH_TOKEN",
];

/// Replace known API key patterns and the literal values of sensitive
/// environment variables with placeholder tokens. Idempotent: redacting
/// already-redacted text is a no-op.
pub fn redact_secrets(input: &str) -> String {
    let mut out = ANTHROPIC_KEY
        .replace_all(input, "[REDACTED:anthropic_key]")
        .into_owned();
    out = GENERIC_SK_KEY
        .replace_all(&out, "[REDACTED:api_key]")
        .into_owned();
    redact_env_values(&out, SENSITIVE_ENV_VARS.iter().copied())
}

/// Replace the literal value of each named environment variable (as
/// currently set in this process) with `[REDACTED:env:<NAME>]`.
pub fn redact_env_values<'a>(input: &str, names: impl Iterator<Item = &'a str>) -> String {
    let mut out = input.to_string();
    for name in names {
        if let Ok(value) = std::env::var(name) {
            if value.len() >= 4 {
                out = out.replace(&value, &format!("[REDACTED:env:{name}]"));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_anthropic_key() {
        let input = "here is my key sk-ant-REDACTED and more text";
        let out = redact_secrets(input);
        assert!(!out.contains("sk-ant-api03"));
        assert!(out.contains("[REDACTED:anthropic_key]"));
    }

    #[test]
    fn redacts_generic_sk_key() {
        let input = "token=sk-abcdefghijklmnopqrstuvwxyz123456";
        let out = redact_secrets(input);
        assert!(!out.contains("sk-abcdefghijklmnopqrstuvwxyz123456"));
        assert!(out.contains("[REDACTED:api_key]"));
    }

    #[test]
    fn redaction_is_idempotent() {
        let input = "leaked sk-ant-REDACTED here";
        let once = redact_secrets(input);
        let twice = redact_secrets(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn redacts_sensitive_env_var_values() {
        std::env::set_var("FLOW_CORE_TEST_TOKEN", "super-secret-value-123");
        let input = "leaked value: super-secret-value-123 in the log";
        let out = redact_env_values(input, std::iter::once("FLOW_CORE_TEST_TOKEN"));
        assert!(!out.contains("super-secret-value-123"));
        assert!(out.contains("[REDACTED:env:FLOW_CORE_TEST_TOKEN]"));
        std::env::remove_var("FLOW_CORE_TEST_TOKEN");
    }

    #[test]
    fn leaves_unrelated_text_untouched() {
        let input = "no secrets here, just a normal log line";
        assert_eq!(redact_secrets(input), input);
    }
}
