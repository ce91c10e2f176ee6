use std::path::Path;

use reqwest::blocking::{multipart, Client};

use super::{NotifyError, Notifier};

/// Posts videos and messages to a Telegram chat through the bot API.
#[derive(Debug, Clone)]
pub struct TelegramPoster {
    client: Client,
    api_url: String,
    api_token: String,
    chat_id: String,
}

impl TelegramPoster {
    pub const API_URL: &'static str = "https://api.telegram.org";
    pub const API_TOKEN_ENV_VAR: &'static str = "RPICAM_TG_API_TOKEN";
    pub const CHAT_ID_ENV_VAR: &'static str = "RPICAM_TG_CHAT_ID";

    pub fn new(api_token: &str, chat_id: &str) -> Result<Self, NotifyError> {
        if api_token.is_empty() || chat_id.is_empty() {
            return Err(NotifyError::MissingCredentials(
                Self::API_TOKEN_ENV_VAR,
                Self::CHAT_ID_ENV_VAR,
            ));
        }
        Ok(Self {
            client: Client::builder().build()?,
            api_url: Self::API_URL.to_string(),
            api_token: api_token.to_string(),
            chat_id: chat_id.to_string(),
        })
    }

    /// Credentials from `RPICAM_TG_API_TOKEN` and `RPICAM_TG_CHAT_ID`.
    pub fn from_env() -> Result<Self, NotifyError> {
        let token = std::env::var(Self::API_TOKEN_ENV_VAR).unwrap_or_default();
        let chat_id = std::env::var(Self::CHAT_ID_ENV_VAR).unwrap_or_default();
        Self::new(&token, &chat_id)
    }

    pub fn with_api_url(mut self, api_url: &str) -> Self {
        self.api_url = api_url.trim_end_matches('/').to_string();
        self
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_url, self.api_token, method)
    }

    fn check(response: reqwest::blocking::Response) -> Result<(), NotifyError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(NotifyError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

impl Notifier for TelegramPoster {
    fn send_video(&self, path: &Path) -> Result<(), NotifyError> {
        if !path.is_file() {
            return Err(NotifyError::FileNotFound(path.to_path_buf()));
        }
        let form = multipart::Form::new()
            .text("chat_id", self.chat_id.clone())
            .file("video", path)?;
        let response = self
            .client
            .post(self.endpoint("sendVideo"))
            .multipart(form)
            .send()?;
        Self::check(response)?;
        log::info!("[telegram] Successfully uploaded file to Telegram.");
        Ok(())
    }

    fn send_text(&self, text: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(self.endpoint("sendMessage"))
            .form(&[("chat_id", self.chat_id.as_str()), ("text", text)])
            .send()?;
        Self::check(response)?;
        log::info!("[telegram] Successfully sent text to Telegram.");
        Ok(())
    }
}
