//! Built-in default configuration profiles for supported providers.

use std::collections::BTreeMap;
use std::env;

use crate::value::Value;

/// Default configuration for one provider: the attribute values sourced from
/// the ambient environment plus the version the tool is pinned to. Every
/// provider config attribute not covered here is sent as unknown, which the
/// plugin treats as unset.
pub(crate) struct ProviderDefaults {
    pub config: BTreeMap<String, Value>,
    pub version_constraint: &'static str,
}

/// Returns the default configuration profile for the provider given by name,
/// or `None` for providers this tool does not (yet) support.
pub(crate) fn defaults(name: &str) -> Option<ProviderDefaults> {
    match name {
        "aws" => Some(ProviderDefaults {
            config: aws_config(),
            version_constraint: "=2.68.0",
        }),
        _ => None,
    }
}

fn aws_config() -> BTreeMap<String, Value> {
    [
        ("profile", "AWS_PROFILE"),
        ("region", "AWS_DEFAULT_REGION"),
        ("access_key", "AWS_ACCESS_KEY_ID"),
        ("secret_key", "AWS_SECRET_ACCESS_KEY"),
        ("shared_credentials_file", "AWS_SHARED_CREDENTIALS_FILE"),
        ("token", "AWS_SESSION_TOKEN"),
    ]
    .into_iter()
    .map(|(attr, var)| {
        (
            attr.to_string(),
            Value::String(env::var(var).unwrap_or_default()),
        )
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aws_profile_exists() {
        let defaults = defaults("aws").unwrap();
        assert_eq!(defaults.version_constraint, "=2.68.0");
        for attr in [
            "profile",
            "region",
            "access_key",
            "secret_key",
            "shared_credentials_file",
            "token",
        ] {
            assert!(
                matches!(defaults.config.get(attr), Some(Value::String(_))),
                "missing environment-sourced attribute {attr}"
            );
        }
    }

    #[test]
    fn test_unsupported_providers_have_no_profile() {
        assert!(defaults("google").is_none());
        assert!(defaults("azurerm").is_none());
        assert!(defaults("").is_none());
    }
}
