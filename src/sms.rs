// src/sms.rs
use crate::config::Config;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use serde::Deserialize;

/// Fire-and-forget text message delivery. Returns the transport's message id.
#[async_trait]
pub trait SmsSender: Send + Sync {
    async fn send(&self, to: &str, body: &str) -> AppResult<String>;
}

/// Twilio Messages API over plain HTTPS.
pub struct TwilioSender {
    client: reqwest::Client,
    api_url: String,
    account_sid: String,
    auth_token: String,
    from: String,
}

#[derive(Deserialize)]
struct TwilioMessage {
    sid: String,
}

impl TwilioSender {
    pub fn from_config(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: config.twilio_api_url.trim_end_matches('/').to_string(),
            account_sid: config.twilio_account_sid.clone(),
            auth_token: config.twilio_auth_token.clone(),
            from: config.twilio_phone_number.clone(),
        }
    }

    fn is_configured(&self) -> bool {
        !self.account_sid.is_empty() && !self.auth_token.is_empty() && !self.from.is_empty()
    }
}

#[async_trait]
impl SmsSender for TwilioSender {
    async fn send(&self, to: &str, body: &str) -> AppResult<String> {
        if !self.is_configured() {
            tracing::error!("SMS transport is not configured");
            return Err(AppError::ExternalService(
                "twilio credentials missing".into(),
            ));
        }
        let url = format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.api_url, self.account_sid
        );
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[("From", self.from.as_str()), ("To", to), ("Body", body)])
            .send()
            .await
            .map_err(|e| {
                tracing::error!("SMS request failed: {}", e);
                AppError::ExternalService(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            tracing::error!("SMS transport rejected message: {} {}", status, detail);
            return Err(AppError::ExternalService(format!("{}: {}", status, detail)));
        }

        let message: TwilioMessage = response.json().await.map_err(|e| {
            tracing::error!("Unreadable SMS transport response: {}", e);
            AppError::ExternalService(e.to_string())
        })?;
        Ok(message.sid)
    }
}
