use serde::Deserialize;
use std::{net::SocketAddr, path::Path};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid public_url '{0}': must be an absolute http(s) URL")]
    PublicUrl(String),

    #[error("invalid proxy_prefix '{0}': must start and end with '/'")]
    ProxyPrefix(String),
}

// プロキシ全体の設定（起動時に一度だけ読み込み、以後は不変）
#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    #[serde(alias = "PublicUrl")]
    pub public_url: String,

    #[serde(alias = "ProxyPrefix", default = "default_proxy_prefix")]
    pub proxy_prefix: String,

    #[serde(alias = "ProxyStaticAssets", default = "default_true")]
    pub proxy_static_assets: bool,

    #[serde(alias = "AllowedReferrers", default)]
    pub allowed_referrers: Vec<String>,

    // Referer とプライベートネットワークのチェック。ローカル検証時のみ false にする
    #[serde(default = "default_true")]
    pub enforce_access_checks: bool,

    #[serde(default = "default_frame_target")]
    pub frame_target: String,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_secs: u64,

    #[serde(default)]
    pub expose_error_details: bool,

    #[serde(default)]
    pub text_sample: bool,
}

fn default_proxy_prefix() -> String {
    "/proxy/".to_string()
}

fn default_true() -> bool {
    true
}

fn default_frame_target() -> String {
    "letsmtTranslatePageIframe".to_string()
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_upstream_timeout() -> u64 {
    30
}

impl ProxyConfig {
    /// Builds a config with defaults for everything except the public URL.
    pub fn new(public_url: impl Into<String>) -> Self {
        Self {
            public_url: public_url.into(),
            proxy_prefix: default_proxy_prefix(),
            proxy_static_assets: true,
            allowed_referrers: Vec::new(),
            enforce_access_checks: true,
            frame_target: default_frame_target(),
            listen_addr: default_listen_addr(),
            upstream_timeout_secs: default_upstream_timeout(),
            expose_error_details: false,
            text_sample: false,
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: ProxyConfig = toml::from_str(raw)?;
        config.validate()
    }

    /// Checks the invariants and normalizes `public_url` (no trailing slash).
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        let parsed = Url::parse(&self.public_url)
            .map_err(|_| ConfigError::PublicUrl(self.public_url.clone()))?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            return Err(ConfigError::PublicUrl(self.public_url));
        }
        self.public_url = self.public_url.trim_end_matches('/').to_string();

        let prefix = &self.proxy_prefix;
        if prefix.len() < 3 || !prefix.starts_with('/') || !prefix.ends_with('/') {
            return Err(ConfigError::ProxyPrefix(self.proxy_prefix));
        }

        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_minimal_toml_with_defaults() {
        let config = ProxyConfig::from_toml_str(r#"public_url = "https://proxy.example.com/""#)
            .unwrap();
        assert_eq!(config.public_url, "https://proxy.example.com");
        assert_eq!(config.proxy_prefix, "/proxy/");
        assert!(config.proxy_static_assets);
        assert!(config.enforce_access_checks);
        assert!(config.allowed_referrers.is_empty());
        assert_eq!(config.upstream_timeout_secs, 30);
    }

    #[test]
    fn accepts_pascal_case_key_names() {
        let config = ProxyConfig::from_toml_str(
            r#"
            PublicUrl = "https://proxy.example.com"
            ProxyPrefix = "/mirror/"
            ProxyStaticAssets = false
            AllowedReferrers = ["https://translate.example.com/", "https://other.example.com"]
            "#,
        )
        .unwrap();
        assert_eq!(config.proxy_prefix, "/mirror/");
        assert!(!config.proxy_static_assets);
        assert_eq!(config.allowed_referrers.len(), 2);
        assert_eq!(config.allowed_referrers[0], "https://translate.example.com/");
    }

    #[test]
    fn rejects_prefix_without_slashes() {
        let mut config = ProxyConfig::new("https://proxy.example.com");
        config.proxy_prefix = "proxy".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::ProxyPrefix(_))));

        let mut config = ProxyConfig::new("https://proxy.example.com");
        config.proxy_prefix = "/".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::ProxyPrefix(_))));
    }

    #[test]
    fn rejects_relative_public_url() {
        let config = ProxyConfig::new("/not/absolute");
        assert!(matches!(config.validate(), Err(ConfigError::PublicUrl(_))));

        let config = ProxyConfig::new("ftp://proxy.example.com");
        assert!(matches!(config.validate(), Err(ConfigError::PublicUrl(_))));
    }
}
