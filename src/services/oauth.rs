use crate::config::{Config, OAuthClientConfig};
use crate::db::UserProfile;
use anyhow::{anyhow, Context, Result};
use rand::{distributions::Alphanumeric, Rng};
use reqwest::Url;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Google,
    Sso,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Google => "google",
            Provider::Sso => "sso",
        }
    }
}

impl TryFrom<&str> for Provider {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.trim().to_lowercase().as_str() {
            "google" => Ok(Provider::Google),
            "sso" => Ok(Provider::Sso),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

/// Userinfo claims. Google reports OIDC standard names, the platform SSO its
/// own; both map onto the same profile.
#[derive(Debug, Deserialize)]
pub struct UserInfoClaims {
    #[serde(alias = "id")]
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, alias = "given_name")]
    pub first_name: Option<String>,
    #[serde(default, alias = "family_name")]
    pub last_name: Option<String>,
    #[serde(default, alias = "picture")]
    pub profile_image_url: Option<String>,
}

/// Users are keyed by provider-qualified subject so the two providers never
/// collide on the same id.
pub fn profile_from_claims(provider: Provider, claims: UserInfoClaims) -> UserProfile {
    UserProfile {
        id: format!("{}:{}", provider.as_str(), claims.sub),
        email: claims.email.map(|e| e.trim().to_lowercase()),
        first_name: claims.first_name,
        last_name: claims.last_name,
        profile_image_url: claims.profile_image_url,
    }
}

pub fn generate_state() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

#[derive(Clone)]
pub struct OAuthService {
    http: reqwest::Client,
    google: Option<OAuthClientConfig>,
    sso: Option<OAuthClientConfig>,
    base_url: String,
}

impl OAuthService {
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("building OAuth HTTP client")?;
        Ok(Self {
            http,
            google: config.google.clone(),
            sso: config.sso.clone(),
            base_url: config.public_base_url.clone(),
        })
    }

    pub fn client(&self, provider: Provider) -> Option<&OAuthClientConfig> {
        match provider {
            Provider::Google => self.google.as_ref(),
            Provider::Sso => self.sso.as_ref(),
        }
    }

    pub fn redirect_uri(&self, provider: Provider) -> String {
        format!("{}/api/callback/{}", self.base_url, provider.as_str())
    }

    pub fn authorize_url(&self, provider: Provider, state: &str) -> Result<Url> {
        let client = self
            .client(provider)
            .ok_or_else(|| anyhow!("{} login is not configured", provider.as_str()))?;
        let redirect_uri = self.redirect_uri(provider);
        let url = Url::parse_with_params(
            &client.authorize_url,
            &[
                ("response_type", "code"),
                ("client_id", client.client_id.as_str()),
                ("redirect_uri", redirect_uri.as_str()),
                ("scope", client.scopes.as_str()),
                ("state", state),
                ("prompt", "select_account"),
            ],
        )?;
        Ok(url)
    }

    pub async fn exchange_code(&self, provider: Provider, code: &str) -> Result<TokenResponse> {
        let client = self
            .client(provider)
            .ok_or_else(|| anyhow!("{} login is not configured", provider.as_str()))?;
        let redirect_uri = self.redirect_uri(provider);

        let resp = self
            .http
            .post(&client.token_url)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri.as_str()),
                ("client_id", client.client_id.as_str()),
                ("client_secret", client.client_secret.as_str()),
            ])
            .send()
            .await
            .context("token request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("token endpoint returned {}: {}", status, body));
        }

        Ok(resp.json::<TokenResponse>().await?)
    }

    pub async fn fetch_profile(&self, provider: Provider, access_token: &str) -> Result<UserProfile> {
        let client = self
            .client(provider)
            .ok_or_else(|| anyhow!("{} login is not configured", provider.as_str()))?;

        let claims = self
            .http
            .get(&client.userinfo_url)
            .bearer_auth(access_token)
            .send()
            .await
            .context("userinfo request failed")?
            .error_for_status()?
            .json::<UserInfoClaims>()
            .await?;

        Ok(profile_from_claims(provider, claims))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use base64::{engine::general_purpose, Engine as _};
    use std::collections::HashMap;

    fn service() -> OAuthService {
        let mut env = HashMap::new();
        env.insert("DATABASE_URL", "postgres://localhost/gw".to_string());
        env.insert("SESSION_KEY", general_purpose::STANDARD.encode([1u8; 32]));
        env.insert("APP_ENC_KEY", general_purpose::STANDARD.encode([2u8; 32]));
        env.insert("GOOGLE_CLIENT_ID", "client-123".to_string());
        env.insert("GOOGLE_CLIENT_SECRET", "shh".to_string());
        env.insert("PUBLIC_BASE_URL", "https://grades.example.org/".to_string());
        let config = Config::from_lookup(|k| env.get(k).cloned()).unwrap();
        OAuthService::new(&config).unwrap()
    }

    #[test]
    fn test_provider_names() {
        assert_eq!(Provider::try_from("Google"), Ok(Provider::Google));
        assert_eq!(Provider::try_from(" sso "), Ok(Provider::Sso));
        assert!(Provider::try_from("replit").is_err());
        assert!(Provider::try_from("github").is_err());
    }

    #[test]
    fn test_authorize_url_carries_state_and_redirect() {
        let svc = service();
        let url = svc.authorize_url(Provider::Google, "abc123").unwrap();
        let params: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(params["client_id"], "client-123");
        assert_eq!(params["state"], "abc123");
        assert_eq!(
            params["redirect_uri"],
            "https://grades.example.org/api/callback/google"
        );
        assert!(url.as_str().starts_with("https://accounts.google.com/"));
    }

    #[test]
    fn test_unconfigured_provider_fails() {
        assert!(service().authorize_url(Provider::Sso, "x").is_err());
    }

    #[test]
    fn test_profile_from_google_claims() {
        let claims: UserInfoClaims = serde_json::from_str(
            r#"{"sub":"1077","email":"Teacher@School.org","given_name":"Rina","family_name":"Putri","picture":"https://img/1"}"#,
        )
        .unwrap();
        let profile = profile_from_claims(Provider::Google, claims);
        assert_eq!(profile.id, "google:1077");
        assert_eq!(profile.email.as_deref(), Some("teacher@school.org"));
        assert_eq!(profile.first_name.as_deref(), Some("Rina"));
        assert_eq!(profile.profile_image_url.as_deref(), Some("https://img/1"));
    }

    #[test]
    fn test_profile_from_sso_claims() {
        let claims: UserInfoClaims =
            serde_json::from_str(r#"{"id":"55","first_name":"Budi","last_name":null}"#).unwrap();
        let profile = profile_from_claims(Provider::Sso, claims);
        assert_eq!(profile.id, "sso:55");
        assert_eq!(profile.email, None);
        assert_eq!(profile.first_name.as_deref(), Some("Budi"));
    }

    #[test]
    fn test_state_is_random_alphanumeric() {
        let a = generate_state();
        let b = generate_state();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }
}
