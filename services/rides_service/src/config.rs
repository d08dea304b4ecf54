use regex::Regex;
use ridepool_common::secret_policy;
use std::env;

#[derive(Clone, Debug)]
pub struct Config {
    pub env_name: String,
    pub env_lower: String,

    pub host: String,
    pub port: u16,
    pub max_body_bytes: usize,

    pub db_url: String,
    pub db_schema: Option<String>,

    pub currency: String,

    pub gateway_base_url: Option<String>,
    pub gateway_key_id: Option<String>,
    pub gateway_webhook_secret: String,

    pub admin_api_secret: Option<String>,
    pub notify_base_url: Option<String>,

    pub allowed_origins: Vec<String>,

    pub pending_payment_ttl_secs: u64,
    pub reconcile_interval_secs: u64,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(v) => {
            let v = v.trim().to_string();
            if v.is_empty() {
                None
            } else {
                Some(v)
            }
        }
        Err(_) => None,
    }
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn normalize_db_url(raw: &str) -> String {
    // Accept SQLAlchemy-style URLs like "postgresql+psycopg://..." by dropping
    // the "+driver" portion.
    if let Some(colon) = raw.find(':') {
        let (scheme, rest) = raw.split_at(colon);
        if let Some(plus) = scheme.find('+') {
            return format!("{}{}", &scheme[..plus], rest);
        }
    }
    raw.to_string()
}

fn validate_postgres_url(url: &str) -> Result<(), String> {
    let scheme = url
        .split_once(':')
        .map(|(s, _)| s.trim().to_lowercase())
        .unwrap_or_default();
    match scheme.as_str() {
        "postgres" | "postgresql" => Ok(()),
        _ => Err("RIDES_DB_URL (or DB_URL) must be a postgres URL".to_string()),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let env_name = env_or("ENV", "dev");
        let env_lower = env_name.trim().to_lowercase();
        let prod_like = secret_policy::is_production_like(&env_name);

        let host = env_or("APP_HOST", "0.0.0.0");
        let port: u16 = env_or("APP_PORT", "8084")
            .parse()
            .map_err(|_| "APP_PORT must be a valid u16".to_string())?;

        let db_raw = env_opt("RIDES_DB_URL")
            .or_else(|| env_opt("DB_URL"))
            .unwrap_or_else(|| "postgresql://ridepool:ridepool@db:5432/ridepool".to_string());
        let db_url = normalize_db_url(&db_raw);
        validate_postgres_url(&db_url)?;

        let db_schema = env_opt("DB_SCHEMA");
        if let Some(s) = &db_schema {
            let re = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").map_err(|e| e.to_string())?;
            if !re.is_match(s) {
                return Err("DB_SCHEMA must match ^[A-Za-z_][A-Za-z0-9_]*$".to_string());
            }
        }

        let currency = env_or("CURRENCY", "INR").trim().to_uppercase();
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err("CURRENCY must be a 3-letter code".to_string());
        }

        let gateway_base_url = env_opt("GATEWAY_BASE_URL");
        let gateway_key_id = env_opt("GATEWAY_KEY_ID");
        if gateway_base_url.is_some()
            && gateway_key_id.is_none()
            && !matches!(env_lower.as_str(), "dev" | "test")
        {
            return Err("GATEWAY_KEY_ID must be set when GATEWAY_BASE_URL is configured".to_string());
        }

        // The webhook secret is always needed: payment verification recomputes
        // the callback HMAC even when orders are minted locally.
        let gateway_webhook_secret = env_or("GATEWAY_WEBHOOK_SECRET", "change-me-gateway-webhook");
        secret_policy::enforce_value_policy_for_env(
            &env_name,
            "GATEWAY_WEBHOOK_SECRET",
            Some(gateway_webhook_secret.as_str()),
            true,
        )?;

        let admin_api_secret = env_opt("ADMIN_API_SECRET");
        if prod_like && admin_api_secret.is_none() {
            return Err("ADMIN_API_SECRET must be set in prod/staging".to_string());
        }
        secret_policy::enforce_value_policy_for_env(
            &env_name,
            "ADMIN_API_SECRET",
            admin_api_secret.as_deref(),
            false,
        )?;

        let notify_base_url = env_opt("NOTIFY_BASE_URL");

        let mut allowed_origins = parse_csv(&env_or("ALLOWED_ORIGINS", ""));
        if allowed_origins.is_empty() {
            // Safe local default for development.
            allowed_origins = vec![
                "http://localhost:5173".to_string(),
                "http://127.0.0.1:5173".to_string(),
            ];
        }
        if prod_like && allowed_origins.iter().any(|o| o.trim() == "*") {
            return Err("ALLOWED_ORIGINS must not contain '*' in prod/staging".to_string());
        }
        if prod_like
            && allowed_origins
                .iter()
                .any(|o| !o.trim().starts_with("https://"))
        {
            return Err("ALLOWED_ORIGINS must use https:// origins in prod/staging".to_string());
        }

        let max_body_bytes: usize = env_or("RIDES_MAX_BODY_BYTES", "1048576")
            .parse()
            .map_err(|_| "RIDES_MAX_BODY_BYTES must be an integer".to_string())?;
        let max_body_bytes = max_body_bytes.clamp(16 * 1024, 10 * 1024 * 1024);

        let pending_payment_ttl_secs: u64 = env_or("PENDING_PAYMENT_TTL_SECS", "900")
            .parse()
            .map_err(|_| "PENDING_PAYMENT_TTL_SECS must be an integer".to_string())?;
        let pending_payment_ttl_secs = pending_payment_ttl_secs.clamp(60, 86_400);

        let reconcile_interval_secs: u64 = env_or("RECONCILE_INTERVAL_SECS", "60")
            .parse()
            .map_err(|_| "RECONCILE_INTERVAL_SECS must be an integer".to_string())?;
        let reconcile_interval_secs = reconcile_interval_secs.clamp(5, 3_600);

        Ok(Self {
            env_name,
            env_lower,
            host,
            port,
            max_body_bytes,
            db_url,
            db_schema,
            currency,
            gateway_base_url,
            gateway_key_id,
            gateway_webhook_secret,
            admin_api_secret,
            notify_base_url,
            allowed_origins,
            pending_payment_ttl_secs,
            reconcile_interval_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    struct EnvGuard {
        saved: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(keys: &[&str]) -> Self {
            let mut keys = keys.to_vec();
            for required in [
                "ENV",
                "RIDES_DB_URL",
                "DB_URL",
                "GATEWAY_WEBHOOK_SECRET",
                "ALLOWED_ORIGINS",
                "RIDES_MAX_BODY_BYTES",
            ] {
                if !keys.contains(&required) {
                    keys.push(required);
                }
            }
            let mut saved = Vec::with_capacity(keys.len());
            for k in keys {
                let existing = env::var(k).ok();
                saved.push((k.to_string(), existing));
                env::remove_var(k);
            }
            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (k, v) in self.saved.drain(..) {
                match v {
                    Some(val) => env::set_var(k, val),
                    None => env::remove_var(k),
                }
            }
        }
    }

    #[test]
    fn rejects_non_postgres_url() {
        let _g = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _env = EnvGuard::new(&[]);

        env::set_var("RIDES_DB_URL", "sqlite:////tmp/rides.db");

        let res = Config::from_env();
        assert!(res.is_err());
    }

    #[test]
    fn normalizes_sqlalchemy_style_url() {
        let _g = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _env = EnvGuard::new(&[]);

        env::set_var(
            "RIDES_DB_URL",
            "postgresql+psycopg://u:p@localhost:5432/rides",
        );

        let cfg = Config::from_env().expect("config");
        assert_eq!(cfg.db_url, "postgresql://u:p@localhost:5432/rides");
    }

    #[test]
    fn prod_rejects_weak_webhook_secret() {
        let _g = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _env = EnvGuard::new(&["ADMIN_API_SECRET"]);

        env::set_var("ENV", "prod");
        env::set_var("RIDES_DB_URL", "postgresql://u:p@localhost:5432/rides");
        env::set_var("ADMIN_API_SECRET", "ffffffffffffffffffffffffffffffff");
        env::set_var("GATEWAY_WEBHOOK_SECRET", "change-me-gateway-webhook");
        env::set_var("ALLOWED_ORIGINS", "https://app.ridepool.example");

        let res = Config::from_env();
        assert!(res.is_err());
    }

    #[test]
    fn prod_requires_admin_secret() {
        let _g = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _env = EnvGuard::new(&["ADMIN_API_SECRET"]);

        env::set_var("ENV", "prod");
        env::set_var("RIDES_DB_URL", "postgresql://u:p@localhost:5432/rides");
        env::set_var("GATEWAY_WEBHOOK_SECRET", "ffffffffffffffffffffffffffffffff");
        env::set_var("ALLOWED_ORIGINS", "https://app.ridepool.example");
        env::remove_var("ADMIN_API_SECRET");

        let err = Config::from_env().expect_err("missing admin secret must fail");
        assert!(err.contains("ADMIN_API_SECRET"));
    }

    #[test]
    fn prod_requires_gateway_key_when_gateway_configured() {
        let _g = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _env = EnvGuard::new(&["ADMIN_API_SECRET", "GATEWAY_BASE_URL", "GATEWAY_KEY_ID"]);

        env::set_var("ENV", "prod");
        env::set_var("RIDES_DB_URL", "postgresql://u:p@localhost:5432/rides");
        env::set_var("GATEWAY_WEBHOOK_SECRET", "ffffffffffffffffffffffffffffffff");
        env::set_var("ADMIN_API_SECRET", "cccccccccccccccccccccccccccccccc");
        env::set_var("ALLOWED_ORIGINS", "https://app.ridepool.example");
        env::set_var("GATEWAY_BASE_URL", "https://gateway.example");
        env::remove_var("GATEWAY_KEY_ID");

        let err = Config::from_env().expect_err("missing gateway key must fail");
        assert!(err.contains("GATEWAY_KEY_ID"));
    }

    #[test]
    fn prod_rejects_wildcard_and_http_origins() {
        let _g = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _env = EnvGuard::new(&["ADMIN_API_SECRET"]);

        env::set_var("ENV", "prod");
        env::set_var("RIDES_DB_URL", "postgresql://u:p@localhost:5432/rides");
        env::set_var("GATEWAY_WEBHOOK_SECRET", "ffffffffffffffffffffffffffffffff");
        env::set_var("ADMIN_API_SECRET", "cccccccccccccccccccccccccccccccc");

        env::set_var("ALLOWED_ORIGINS", "*");
        let err = Config::from_env().expect_err("wildcard origins must be rejected");
        assert!(err.contains("ALLOWED_ORIGINS"));

        env::set_var("ALLOWED_ORIGINS", "http://app.ridepool.example");
        let err = Config::from_env().expect_err("http origins must be rejected");
        assert!(err.contains("https://"));
    }

    #[test]
    fn body_limit_and_ttl_are_clamped() {
        let _g = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _env = EnvGuard::new(&["PENDING_PAYMENT_TTL_SECS", "RECONCILE_INTERVAL_SECS"]);

        env::set_var("ENV", "dev");
        env::set_var("RIDES_DB_URL", "postgresql://u:p@localhost:5432/rides");

        env::set_var("RIDES_MAX_BODY_BYTES", "1");
        env::set_var("PENDING_PAYMENT_TTL_SECS", "1");
        env::set_var("RECONCILE_INTERVAL_SECS", "999999");
        let cfg = Config::from_env().expect("config");
        assert_eq!(cfg.max_body_bytes, 16 * 1024);
        assert_eq!(cfg.pending_payment_ttl_secs, 60);
        assert_eq!(cfg.reconcile_interval_secs, 3_600);
    }

    #[test]
    fn rejects_malformed_currency() {
        let _g = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _env = EnvGuard::new(&["CURRENCY"]);

        env::set_var("ENV", "dev");
        env::set_var("RIDES_DB_URL", "postgresql://u:p@localhost:5432/rides");
        env::set_var("CURRENCY", "RUPEES");

        let res = Config::from_env();
        assert!(res.is_err());
    }
}
