use base64::{engine::general_purpose, Engine as _};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} missing")]
    Missing(&'static str),
    #[error("{0} invalid: {1}")]
    Invalid(&'static str, String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: String,
    pub authorize_url: String,
    pub token_url: String,
    pub userinfo_url: String,
    pub scopes: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub max_connections: u32,
    pub session_key: Vec<u8>,
    pub enc_key: Vec<u8>,
    pub bind_addr: String,
    pub static_dir: String,
    pub public_base_url: String,
    pub secure_cookies: bool,
    /// Honour `X-Forwarded-For` from the reverse proxy in front of us.
    pub trust_proxy: bool,
    pub google: Option<OAuthClientConfig>,
    pub sso: Option<OAuthClientConfig>,
    pub bootstrap_superadmins: Vec<String>,
}

const GOOGLE_AUTHORIZE_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_USERINFO_URL: &str = "https://openidconnect.googleapis.com/v1/userinfo";

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let max_connections = match get("DATABASE_MAX_CONNECTIONS") {
            Some(raw) => raw
                .parse::<u32>()
                .map_err(|e| ConfigError::Invalid("DATABASE_MAX_CONNECTIONS", e.to_string()))?,
            None => 10,
        };

        let session_key = decode_key(
            "SESSION_KEY",
            get("SESSION_KEY").ok_or(ConfigError::Missing("SESSION_KEY"))?,
        )?;
        if session_key.len() < 32 {
            return Err(ConfigError::Invalid(
                "SESSION_KEY",
                "must decode to at least 32 bytes".to_string(),
            ));
        }

        let enc_key = decode_key(
            "APP_ENC_KEY",
            get("APP_ENC_KEY").ok_or(ConfigError::Missing("APP_ENC_KEY"))?,
        )?;
        if enc_key.len() != 32 {
            return Err(ConfigError::Invalid(
                "APP_ENC_KEY",
                "must decode to exactly 32 bytes".to_string(),
            ));
        }

        let bind_addr = get("BIND_ADDR").unwrap_or_else(|| {
            let port = get("PORT").unwrap_or_else(|| "3000".to_string());
            format!("0.0.0.0:{}", port)
        });

        let secure_cookies = ["PRODUCTION", "RAILWAY_ENVIRONMENT", "RENDER", "FLY_APP_NAME"]
            .iter()
            .any(|k| get(k).is_some());

        let trust_proxy = get("TRUST_PROXY")
            .is_some_and(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"));

        let google = match (get("GOOGLE_CLIENT_ID"), get("GOOGLE_CLIENT_SECRET")) {
            (Some(client_id), Some(client_secret)) => Some(OAuthClientConfig {
                client_id,
                client_secret,
                authorize_url: GOOGLE_AUTHORIZE_URL.to_string(),
                token_url: GOOGLE_TOKEN_URL.to_string(),
                userinfo_url: GOOGLE_USERINFO_URL.to_string(),
                scopes: "openid email profile".to_string(),
            }),
            _ => None,
        };

        let sso = match (get("SSO_CLIENT_ID"), get("SSO_CLIENT_SECRET"), get("SSO_ISSUER_URL")) {
            (Some(client_id), Some(client_secret), Some(issuer)) => {
                let issuer = issuer.trim_end_matches('/').to_string();
                Some(OAuthClientConfig {
                    client_id,
                    client_secret,
                    authorize_url: format!("{issuer}/auth"),
                    token_url: format!("{issuer}/token"),
                    userinfo_url: format!("{issuer}/me"),
                    scopes: "openid email profile".to_string(),
                })
            }
            _ => None,
        };

        let bootstrap_superadmins = get("BOOTSTRAP_SUPERADMIN_EMAILS")
            .map(|raw| {
                raw.split(',')
                    .map(|e| e.trim().to_lowercase())
                    .filter(|e| !e.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            database_url,
            max_connections,
            session_key,
            enc_key,
            bind_addr,
            static_dir: get("STATIC_DIR").unwrap_or_else(|| "static".to_string()),
            public_base_url: get("PUBLIC_BASE_URL")
                .unwrap_or_else(|| "http://localhost:3000".to_string())
                .trim_end_matches('/')
                .to_string(),
            secure_cookies,
            trust_proxy,
            google,
            sso,
            bootstrap_superadmins,
        })
    }

    pub fn is_bootstrap_superadmin(&self, email: &str) -> bool {
        let email = email.trim().to_lowercase();
        self.bootstrap_superadmins.iter().any(|e| *e == email)
    }
}

fn decode_key(name: &'static str, raw: String) -> Result<Vec<u8>, ConfigError> {
    general_purpose::STANDARD
        .decode(raw)
        .map_err(|e| ConfigError::Invalid(name, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn key_b64(len: usize) -> String {
        general_purpose::STANDARD.encode(vec![7u8; len])
    }

    fn base_env() -> HashMap<&'static str, String> {
        let mut env = HashMap::new();
        env.insert("DATABASE_URL", "postgres://localhost/gradewise".to_string());
        env.insert("SESSION_KEY", key_b64(32));
        env.insert("APP_ENC_KEY", key_b64(32));
        env
    }

    fn load(env: &HashMap<&'static str, String>) -> Result<Config, ConfigError> {
        Config::from_lookup(|k| env.get(k).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = load(&base_env()).unwrap();
        assert_eq!(cfg.bind_addr, "0.0.0.0:3000");
        assert_eq!(cfg.max_connections, 10);
        assert_eq!(cfg.static_dir, "static");
        assert!(!cfg.secure_cookies);
        assert!(!cfg.trust_proxy);
        assert!(cfg.google.is_none());
        assert!(cfg.sso.is_none());
    }

    #[test]
    fn test_missing_database_url() {
        let mut env = base_env();
        env.remove("DATABASE_URL");
        assert_eq!(load(&env).unwrap_err(), ConfigError::Missing("DATABASE_URL"));
    }

    #[test]
    fn test_short_keys_rejected() {
        let mut env = base_env();
        env.insert("APP_ENC_KEY", key_b64(16));
        assert!(matches!(load(&env), Err(ConfigError::Invalid("APP_ENC_KEY", _))));

        let mut env = base_env();
        env.insert("SESSION_KEY", "not base64!".to_string());
        assert!(matches!(load(&env), Err(ConfigError::Invalid("SESSION_KEY", _))));
    }

    #[test]
    fn test_port_and_production_flags() {
        let mut env = base_env();
        env.insert("PORT", "8080".to_string());
        env.insert("RENDER", "true".to_string());
        let cfg = load(&env).unwrap();
        assert_eq!(cfg.bind_addr, "0.0.0.0:8080");
        assert!(cfg.secure_cookies);
    }

    #[test]
    fn test_trust_proxy_flag() {
        let mut env = base_env();
        env.insert("TRUST_PROXY", "True".to_string());
        assert!(load(&env).unwrap().trust_proxy);

        env.insert("TRUST_PROXY", "no".to_string());
        assert!(!load(&env).unwrap().trust_proxy);
    }

    #[test]
    fn test_providers_enabled_by_credentials() {
        let mut env = base_env();
        env.insert("GOOGLE_CLIENT_ID", "gid".to_string());
        env.insert("GOOGLE_CLIENT_SECRET", "gsecret".to_string());
        env.insert("SSO_CLIENT_ID", "sid".to_string());
        env.insert("SSO_CLIENT_SECRET", "ssecret".to_string());
        env.insert("SSO_ISSUER_URL", "https://sso.example.com/oidc/".to_string());
        let cfg = load(&env).unwrap();
        assert_eq!(cfg.google.unwrap().client_id, "gid");
        let sso = cfg.sso.unwrap();
        assert_eq!(sso.token_url, "https://sso.example.com/oidc/token");
    }

    #[test]
    fn test_bootstrap_superadmins_normalized() {
        let mut env = base_env();
        env.insert("BOOTSTRAP_SUPERADMIN_EMAILS", " Head@School.org, ,ops@school.org".to_string());
        let cfg = load(&env).unwrap();
        assert!(cfg.is_bootstrap_superadmin("head@school.org"));
        assert!(cfg.is_bootstrap_superadmin("OPS@school.org "));
        assert!(!cfg.is_bootstrap_superadmin("teacher@school.org"));
    }
}
