pub fn is_production_like(env_name: &str) -> bool {
    let env = env_name.trim().to_ascii_lowercase();
    matches!(env.as_str(), "prod" | "production" | "staging")
}

/// Rejects missing, short, or placeholder-looking secrets in prod/staging.
/// Dev and test environments are left alone for local ergonomics.
pub fn enforce_value_policy_for_env(
    env_name: &str,
    key: &str,
    value: Option<&str>,
    required_in_prod: bool,
) -> Result<(), String> {
    if !is_production_like(env_name) {
        return Ok(());
    }

    let secret = value.map(str::trim).unwrap_or("");
    if secret.is_empty() {
        if required_in_prod {
            return Err(format!("{key} must be set in prod/staging"));
        }
        return Ok(());
    }

    if secret.len() < 16 {
        return Err(format!(
            "{key} must be at least 16 characters in prod/staging"
        ));
    }
    if looks_like_placeholder(secret) {
        return Err(format!(
            "{key} looks like a placeholder/default value; use a strong random secret"
        ));
    }
    Ok(())
}

fn looks_like_placeholder(secret: &str) -> bool {
    let s = secret.trim().to_ascii_lowercase();
    let banned_exact = [
        "change-me",
        "changeme",
        "secret",
        "password",
        "default",
        "dummy",
        "example",
        "test",
        "hunter2",
        "letmein",
    ];
    if banned_exact.iter().any(|v| *v == s) {
        return true;
    }

    let banned_fragments = [
        "change-me",
        "change_me",
        "replace-me",
        "replace_me",
        "set-me",
        "your-secret",
        "your_secret",
        "dev-secret",
        "dev_secret",
        "insecure",
    ];
    banned_fragments.iter().any(|v| s.contains(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_prod_skips_validation() {
        let res = enforce_value_policy_for_env("dev", "GATEWAY_WEBHOOK_SECRET", Some("x"), true);
        assert!(res.is_ok());
    }

    #[test]
    fn prod_requires_value_when_mandatory() {
        let res = enforce_value_policy_for_env("prod", "GATEWAY_WEBHOOK_SECRET", None, true);
        assert!(res.is_err());
    }

    #[test]
    fn prod_rejects_short_secret() {
        let res = enforce_value_policy_for_env("prod", "GATEWAY_WEBHOOK_SECRET", Some("short"), true);
        assert!(res.is_err());
    }

    #[test]
    fn prod_rejects_placeholder_like_secret() {
        let res = enforce_value_policy_for_env(
            "staging",
            "ADMIN_API_SECRET",
            Some("change-me-please-rotate-later"),
            true,
        );
        assert!(res.is_err());
    }

    #[test]
    fn prod_accepts_strong_secret() {
        let res = enforce_value_policy_for_env(
            "prod",
            "ADMIN_API_SECRET",
            Some("kR8w_pT3qN7vX2mL9sD4"),
            true,
        );
        assert!(res.is_ok());
    }
}
