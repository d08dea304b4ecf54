use reqwest::Client;
use sqlx::PgPool;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub db_schema: Option<String>,
    pub env_name: String,
    pub env_lower: String,
    pub currency: String,
    pub gateway_base_url: Option<String>,
    pub gateway_key_id: Option<String>,
    pub gateway_webhook_secret: String,
    pub admin_api_secret: Option<String>,
    pub notify_base_url: Option<String>,
    pub http: Client,
}

impl AppState {
    pub fn table(&self, name: &str) -> String {
        match &self.db_schema {
            Some(s) => format!("{s}.{name}"),
            None => name.to_string(),
        }
    }

    /// Orders are created at the external gateway only when a base URL is
    /// configured; dev/test runs mint local order ids instead.
    pub fn gateway_enabled(&self) -> bool {
        self.gateway_base_url.as_deref().unwrap_or("").trim() != ""
    }

    pub fn notify_enabled(&self) -> bool {
        self.notify_base_url.as_deref().unwrap_or("").trim() != ""
    }
}
