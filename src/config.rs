// src/config.rs
use serde::Deserialize;

/// How `initial_date`/`end_date` behave across repeated status updates.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TermPolicy {
    /// Every status update restarts the 11-month term from now.
    #[default]
    ResetOnUpdate,
    /// The term is stamped once, on the first status update, and kept afterwards.
    FixedFromFirstActivation,
}

#[derive(Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub jwt_secret: String,
    #[serde(default = "default_token_ttl_hours")]
    pub token_ttl_hours: i64,
    pub razorpay_key_id: String,
    pub razorpay_key_secret: String,
    #[serde(default = "default_razorpay_api_url")]
    pub razorpay_api_url: String,
    #[serde(default = "default_currency")]
    pub payment_currency: String,
    #[serde(default)]
    pub term_policy: TermPolicy,
    #[serde(default)]
    pub twilio_account_sid: String,
    #[serde(default)]
    pub twilio_auth_token: String,
    #[serde(default)]
    pub twilio_phone_number: String,
    #[serde(default = "default_twilio_api_url")]
    pub twilio_api_url: String,
    #[serde(default = "default_country_code")]
    pub sms_country_code: String,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::from_env()
    }
}

// Secrets stay out of Debug output.
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("token_ttl_hours", &self.token_ttl_hours)
            .field("razorpay_key_id", &self.razorpay_key_id)
            .field("razorpay_api_url", &self.razorpay_api_url)
            .field("payment_currency", &self.payment_currency)
            .field("term_policy", &self.term_policy)
            .field("twilio_api_url", &self.twilio_api_url)
            .field("sms_country_code", &self.sms_country_code)
            .field("bind_address", &self.bind_address)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

fn default_token_ttl_hours() -> i64 {
    168
}

fn default_razorpay_api_url() -> String {
    "https://api.razorpay.com/v1".to_string()
}

fn default_currency() -> String {
    "INR".to_string()
}

fn default_twilio_api_url() -> String {
    "https://api.twilio.com".to_string()
}

fn default_country_code() -> String {
    "+91".to_string()
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(extra: &[(&str, &str)]) -> Vec<(String, String)> {
        let mut v: Vec<(String, String)> = [
            ("DATABASE_URL", "postgres://localhost/gold"),
            ("JWT_SECRET", "jwt"),
            ("RAZORPAY_KEY_ID", "rzp_test"),
            ("RAZORPAY_KEY_SECRET", "secret"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        v.extend(extra.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        v
    }

    #[test]
    fn defaults_fill_optional_fields() {
        let config: Config = envy::from_iter(vars(&[])).unwrap();
        assert_eq!(config.token_ttl_hours, 168);
        assert_eq!(config.payment_currency, "INR");
        assert_eq!(config.term_policy, TermPolicy::ResetOnUpdate);
        assert_eq!(config.sms_country_code, "+91");
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn term_policy_is_configurable() {
        let config: Config =
            envy::from_iter(vars(&[("TERM_POLICY", "fixed_from_first_activation")])).unwrap();
        assert_eq!(config.term_policy, TermPolicy::FixedFromFirstActivation);
    }

    #[test]
    fn debug_output_hides_secrets() {
        let config: Config = envy::from_iter(vars(&[])).unwrap();
        let printed = format!("{:?}", config);
        assert!(!printed.contains("secret"));
        assert!(!printed.contains("postgres://"));
    }
}
