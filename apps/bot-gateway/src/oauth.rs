use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::config::OAuthSettings;

const FINGERPRINT_LEN: usize = 16;

/// What conversation state remembers about a sign-in. Never the token itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRef {
    pub provider: String,
    /// Leading hex digits of the SHA-256 of the access token.
    pub fingerprint: String,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
}

/// An authorization code delivered for one conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthCallback {
    pub tenant: String,
    pub conversation_id: String,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl TokenGrant {
    pub fn credential_ref(&self, provider: &str, now: OffsetDateTime) -> CredentialRef {
        CredentialRef {
            provider: provider.to_string(),
            fingerprint: fingerprint(&self.access_token),
            issued_at: now,
            expires_at: self
                .expires_in
                .map(|secs| now + Duration::from_secs(secs)),
        }
    }
}

pub fn fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(FINGERPRINT_LEN);
    hex
}

/// Exchanges an authorization code with the identity provider.
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn exchange(&self, code: &str) -> anyhow::Result<TokenGrant>;
    fn provider(&self) -> &str;
}

/// Standard `authorization_code` grant against a token endpoint.
#[derive(Clone)]
pub struct HttpTokenExchanger {
    http: Client,
    settings: OAuthSettings,
}

impl HttpTokenExchanger {
    pub fn new(http: Client, settings: OAuthSettings) -> Self {
        Self { http, settings }
    }
}

#[async_trait]
impl TokenExchanger for HttpTokenExchanger {
    async fn exchange(&self, code: &str) -> anyhow::Result<TokenGrant> {
        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", self.settings.client_id.as_str()),
            ("client_secret", self.settings.client_secret.as_str()),
        ];
        if let Some(redirect_uri) = self.settings.redirect_uri.as_deref() {
            params.push(("redirect_uri", redirect_uri));
        }
        let response = self
            .http
            .post(&self.settings.token_url)
            .form(&params)
            .send()
            .await
            .context("failed to call token endpoint")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("token endpoint returned {status}: {body}");
        }
        let grant: TokenGrant = response
            .json()
            .await
            .context("token endpoint returned an unexpected body")?;
        if grant.access_token.trim().is_empty() {
            bail!("token endpoint returned an empty access token");
        }
        Ok(grant)
    }

    fn provider(&self) -> &str {
        &self.settings.provider
    }
}

/// Used when no identity provider is configured; every exchange fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledTokenExchanger;

#[async_trait]
impl TokenExchanger for DisabledTokenExchanger {
    async fn exchange(&self, _code: &str) -> anyhow::Result<TokenGrant> {
        Err(anyhow!("oauth is not configured"))
    }

    fn provider(&self) -> &str {
        "disabled"
    }
}

/// Encodes the redirect `state` parameter for a conversation.
pub fn encode_state(tenant: &str, conversation_id: &str) -> String {
    URL_SAFE_NO_PAD.encode(format!("{tenant}|{conversation_id}"))
}

pub fn decode_state(state: &str) -> anyhow::Result<(String, String)> {
    let decoded = URL_SAFE_NO_PAD
        .decode(state.trim())
        .map_err(|err| anyhow!("invalid state: {err}"))?;
    let raw = String::from_utf8(decoded)?;
    let (tenant, conversation) = raw
        .split_once('|')
        .ok_or_else(|| anyhow!("state missing conversation"))?;
    let tenant = tenant.trim();
    let conversation = conversation.trim();
    if tenant.is_empty() || conversation.is_empty() {
        bail!("state has an empty tenant or conversation");
    }
    Ok((tenant.to_string(), conversation.to_string()))
}
