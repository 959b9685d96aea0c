//! Configuration loading for the `vigil` server.
//!
//! Configuration is loaded once at startup from a TOML file and treated as
//! read-only for the lifetime of the process (the separate Domain Monitor
//! config is the one piece that reloads, on `SIGHUP`; see [`crate::domain`]).

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Loads server configuration from a TOML file, expanding `${VAR}`
/// references in secret fields against the process environment.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    load_config_str(&content)
}

pub fn load_config_str(content: &str) -> Result<Config> {
    let mut config: Config =
        toml::from_str(content).context("failed to parse configuration as TOML")?;

    expand_secrets(&mut config).context("failed to expand environment references in config")?;

    Ok(config)
}

/// Expands `${VAR}` / `${VAR:-default}` references in every field that may
/// reasonably hold a secret or environment-specific path.
fn expand_secrets(config: &mut Config) -> Result<(), anyhow::Error> {
    config.sandbox.browser_executable_path =
        expand_env_value(&config.sandbox.browser_executable_path)
            .map_err(|e| anyhow::anyhow!(e))?;
    config.alert_transport.api_token =
        expand_env_value(&config.alert_transport.api_token).map_err(|e| anyhow::anyhow!(e))?;
    config.auth.admin_token =
        expand_env_value(&config.auth.admin_token).map_err(|e| anyhow::anyhow!(e))?;
    config.auth.monitor_token =
        expand_env_value(&config.auth.monitor_token).map_err(|e| anyhow::anyhow!(e))?;
    if let Some(escalation) = config.escalation.as_mut() {
        escalation.token = expand_env_value(&escalation.token).map_err(|e| anyhow::anyhow!(e))?;
    }
    Ok(())
}

/// Expands environment variable references in a string value.
///
/// Syntax:
/// - `${VAR}` - required, fails if VAR is not set
/// - `${VAR:-default}` - optional, uses "default" if VAR not set
/// - `$$` - escaped dollar sign (becomes single `$`)
pub fn expand_env_value(value: &str) -> Result<String, String> {
    let mut result = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' {
            match chars.peek() {
                Some('$') => {
                    chars.next();
                    result.push('$');
                }
                Some('{') => {
                    chars.next(); // consume '{'

                    let mut var_content = String::new();
                    let mut found_close = false;

                    for c in chars.by_ref() {
                        if c == '}' {
                            found_close = true;
                            break;
                        }
                        var_content.push(c);
                    }

                    if !found_close {
                        return Err(format!("unclosed variable reference: ${{{var_content}"));
                    }

                    let (var_name, default_value) = if let Some(idx) = var_content.find(":-") {
                        let (name, rest) = var_content.split_at(idx);
                        (name, Some(&rest[2..]))
                    } else {
                        (var_content.as_str(), None)
                    };

                    if var_name.is_empty() {
                        return Err("empty variable name in ${}".to_string());
                    }

                    match std::env::var(var_name) {
                        Ok(val) => result.push_str(&val),
                        Err(_) => {
                            if let Some(default) = default_value {
                                result.push_str(default);
                            } else {
                                return Err(format!(
                                    "required environment variable not set: {var_name}"
                                ));
                            }
                        }
                    }
                }
                _ => result.push('$'),
            }
        } else {
            result.push(ch);
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_env_value_no_variables() {
        assert_eq!(expand_env_value("hello world").unwrap(), "hello world");
    }

    #[test]
    fn expand_env_value_escaped_dollar() {
        assert_eq!(expand_env_value("price is $$100").unwrap(), "price is $100");
    }

    #[test]
    fn expand_env_value_literal_dollar_no_brace() {
        assert_eq!(expand_env_value("$x and $y").unwrap(), "$x and $y");
    }

    #[test]
    fn expand_env_value_empty_var_name() {
        let result = expand_env_value("${}");
        assert!(matches!(&result, Err(e) if e.contains("empty variable name")));
    }

    #[test]
    fn expand_env_value_unclosed_brace() {
        let result = expand_env_value("${VAR");
        assert!(matches!(&result, Err(e) if e.contains("unclosed variable reference")));
    }

    #[test]
    fn expand_env_value_var_set() {
        let result = expand_env_value("${HOME}").unwrap();
        assert!(!result.is_empty());
    }

    #[test]
    fn expand_env_value_var_unset_no_default() {
        let result = expand_env_value("${_VIGIL_TEST_NONEXISTENT_VAR}");
        assert!(result.is_err());
    }

    #[test]
    fn expand_env_value_default_used_when_unset() {
        let result = expand_env_value("${_VIGIL_TEST_MISSING:-fallback}").unwrap();
        assert_eq!(result, "fallback");
    }

    #[test]
    fn expand_env_value_empty_default() {
        let result = expand_env_value("${_VIGIL_TEST_MISSING:-}").unwrap();
        assert_eq!(result, "");
    }

    #[test]
    fn load_config_str_expands_secrets() {
        // SAFETY: test-local env var, not read by other tests concurrently.
        unsafe {
            std::env::set_var("_VIGIL_DOC_TEST_TOKEN", "expanded-token");
        }
        let toml = r#"
            [alert_transport]
            api_base_url = "https://chat.example.com"
            api_token = "${_VIGIL_DOC_TEST_TOKEN}"

            [auth]
            admin_token = "admin"
            monitor_token = "monitor"
        "#;
        let config = load_config_str(toml).unwrap();
        assert_eq!(config.alert_transport.api_token, "expanded-token");
        unsafe {
            std::env::remove_var("_VIGIL_DOC_TEST_TOKEN");
        }
    }
}
