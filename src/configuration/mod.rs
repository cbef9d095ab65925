use hyper::Uri;
use jsonwebtoken::Algorithm;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

mod error;
pub mod watcher;

pub use error::Error;

const IN_CLUSTER_CA_BUNDLE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";
const IN_CLUSTER_TOKEN_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

#[derive(Clone, Debug, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    pub oidc: OidcConfig,
    #[serde(default)]
    pub token_passthrough: TokenPassthroughConfig,
    #[serde(default)]
    pub proxy: ProxyOptions,
    #[serde(default)]
    pub upstream: Option<UpstreamConfig>,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub observability: Option<ObservabilityConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "GlobalConfig::default_worker_threads")]
    pub worker_threads: usize,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        GlobalConfig {
            worker_threads: GlobalConfig::default_worker_threads(),
        }
    }
}

impl GlobalConfig {
    fn default_worker_threads() -> usize {
        4
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "ServerConfig::default_bind_address")]
    pub bind_address: IpAddr,
    #[serde(default = "ServerConfig::default_port")]
    pub port: u16,
    #[serde(default = "ServerConfig::default_query_timeout")]
    pub query_timeout: u64,
    #[serde(default = "ServerConfig::default_query_timeout_grace_period")]
    pub query_timeout_grace_period: u64,
    pub tls: Option<ServerTlsConfig>,
}

impl ServerConfig {
    fn default_bind_address() -> IpAddr {
        IpAddr::from(Ipv4Addr::UNSPECIFIED)
    }

    fn default_port() -> u16 {
        6443
    }

    fn default_query_timeout() -> u64 {
        3600
    }

    fn default_query_timeout_grace_period() -> u64 {
        60
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: Self::default_bind_address(),
            port: Self::default_port(),
            query_timeout: Self::default_query_timeout(),
            query_timeout_grace_period: Self::default_query_timeout_grace_period(),
            tls: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServerTlsConfig {
    pub server_certificate_bundle: String,
    pub server_private_key: String,
    pub client_ca_bundle: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "ProbeConfig::default_bind_address")]
    pub bind_address: IpAddr,
    #[serde(default = "ProbeConfig::default_port")]
    pub port: u16,
}

impl ProbeConfig {
    fn default_bind_address() -> IpAddr {
        IpAddr::from(Ipv4Addr::UNSPECIFIED)
    }

    fn default_port() -> u16 {
        8080
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            bind_address: Self::default_bind_address(),
            port: Self::default_port(),
        }
    }
}

/// Delays driving the startup and shutdown sequence, in seconds.
#[derive(Clone, Debug, Deserialize)]
pub struct LifecycleConfig {
    /// Upper bound on the wait for the identity provider before binding.
    #[serde(default = "LifecycleConfig::default_provider_warmup_timeout")]
    pub provider_warmup_timeout: u64,
    /// Delay between the listener coming up and readiness being reported.
    #[serde(default = "LifecycleConfig::default_readiness_grace_period")]
    pub readiness_grace_period: u64,
    /// Window granted to in-flight requests once a stop signal is received.
    #[serde(default = "LifecycleConfig::default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl LifecycleConfig {
    fn default_provider_warmup_timeout() -> u64 {
        10
    }

    fn default_readiness_grace_period() -> u64 {
        3
    }

    fn default_shutdown_timeout() -> u64 {
        60
    }

    pub fn provider_warmup_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_warmup_timeout)
    }

    pub fn readiness_grace_period(&self) -> Duration {
        Duration::from_secs(self.readiness_grace_period)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            provider_warmup_timeout: Self::default_provider_warmup_timeout(),
            readiness_grace_period: Self::default_readiness_grace_period(),
            shutdown_timeout: Self::default_shutdown_timeout(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct OidcConfig {
    pub issuer_url: String,
    pub client_id: String,
    #[serde(default)]
    pub api_audiences: Vec<String>,
    #[serde(default = "OidcConfig::default_username_claim")]
    pub username_claim: String,
    #[serde(default)]
    pub username_prefix: Option<String>,
    #[serde(default)]
    pub groups_claim: Option<String>,
    #[serde(default)]
    pub groups_prefix: Option<String>,
    #[serde(default)]
    pub required_claims: HashMap<String, String>,
    #[serde(default = "OidcConfig::default_signing_algs")]
    pub signing_algs: Vec<String>,
    #[serde(default)]
    pub ca_file: Option<String>,
    #[serde(default = "OidcConfig::default_jwks_refresh_interval")]
    pub jwks_refresh_interval: u64,
    #[serde(default = "OidcConfig::default_clock_skew_tolerance")]
    pub clock_skew_tolerance: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
}

const ASYMMETRIC_SIGNING_ALGS: [Algorithm; 8] = [
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::ES256,
    Algorithm::ES384,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
];

impl OidcConfig {
    fn default_username_claim() -> String {
        "sub".to_string()
    }

    fn default_signing_algs() -> Vec<String> {
        vec!["RS256".to_string()]
    }

    fn default_jwks_refresh_interval() -> u64 {
        3600
    }

    fn default_clock_skew_tolerance() -> u64 {
        60
    }

    /// Parses `signing_algs`. Only asymmetric algorithms are accepted, so a
    /// symmetric key published in the key set can never verify a token.
    pub fn algorithms(&self) -> Result<Vec<Algorithm>, Error> {
        self.signing_algs
            .iter()
            .map(|alg| match Algorithm::from_str(alg) {
                Ok(algorithm) if ASYMMETRIC_SIGNING_ALGS.contains(&algorithm) => Ok(algorithm),
                _ => Err(Error::Validation(format!("unsupported signing algorithm: {alg}"))),
            })
            .collect()
    }

    fn validate(&self) -> Result<(), Error> {
        let issuer = Uri::try_from(self.issuer_url.as_str())
            .map_err(|e| Error::Validation(format!("invalid OIDC issuer URL: {e}")))?;
        if issuer.scheme_str() != Some("https") {
            return Err(Error::Validation(
                "OIDC issuer URL must use the https scheme".to_string(),
            ));
        }

        if self.client_id.is_empty() {
            return Err(Error::Validation("OIDC client id is required".to_string()));
        }

        if self.username_claim.is_empty() {
            return Err(Error::Validation(
                "OIDC username claim must not be empty".to_string(),
            ));
        }

        if self.signing_algs.is_empty() {
            return Err(Error::Validation(
                "at least one OIDC signing algorithm is required".to_string(),
            ));
        }
        self.algorithms()?;

        if self.jwks_refresh_interval == 0 {
            return Err(Error::Validation(
                "OIDC key set refresh interval must be at least one second".to_string(),
            ));
        }

        if self.request_timeout == 0 {
            return Err(Error::Validation(
                "OIDC request timeout must be at least one second".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct TokenPassthroughConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub audiences: Vec<String>,
    #[serde(default)]
    pub allow_client_impersonation: bool,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ProxyOptions {
    #[serde(default)]
    pub disable_impersonation: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct UpstreamConfig {
    pub url: String,
    pub server_ca_bundle: Option<String>,
    pub client_certificate: Option<String>,
    pub client_private_key: Option<String>,
    pub token_file: Option<PathBuf>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
}

fn default_request_timeout() -> u64 {
    10
}

impl UpstreamConfig {
    /// Service account defaults for a proxy running inside the cluster.
    pub fn in_cluster() -> Result<Self, Error> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST").map_err(|_| {
            Error::Validation(
                "no [upstream] section and KUBERNETES_SERVICE_HOST is not set".to_string(),
            )
        })?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());

        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host
        };

        Ok(Self {
            url: format!("https://{host}:{port}"),
            server_ca_bundle: Some(IN_CLUSTER_CA_BUNDLE.to_string()),
            client_certificate: None,
            client_private_key: None,
            token_file: Some(PathBuf::from(IN_CLUSTER_TOKEN_FILE)),
            request_timeout: default_request_timeout(),
        })
    }

    pub fn uri(&self) -> Result<Uri, Error> {
        let uri = Uri::try_from(self.url.as_str())
            .map_err(|e| Error::Validation(format!("invalid upstream URL: {e}")))?;

        match (uri.scheme_str(), uri.authority()) {
            (Some("https" | "http"), Some(_)) => Ok(uri),
            _ => Err(Error::Validation(format!(
                "upstream URL must be absolute http(s): {}",
                self.url
            ))),
        }
    }

    fn validate(&self) -> Result<(), Error> {
        self.uri()?;

        if self.request_timeout == 0 {
            return Err(Error::Validation(
                "upstream request timeout must be at least one second".to_string(),
            ));
        }

        if self.client_certificate.is_some() != self.client_private_key.is_some() {
            return Err(Error::Validation(
                "upstream client certificate and private key must be provided together"
                    .to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct WatchConfig {
    #[serde(default)]
    pub files: Vec<PathBuf>,
    #[serde(default = "WatchConfig::default_reload_interval")]
    pub reload_interval: u64,
}

impl WatchConfig {
    fn default_reload_interval() -> u64 {
        10
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval)
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            reload_interval: Self::default_reload_interval(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub tracing: Option<TracingConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TracingConfig {
    pub endpoint: String,
    pub sampling_rate: f64,
}

impl Configuration {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let config_str = fs::read_to_string(path)?;
        Self::load_from_str(&config_str)
    }

    pub fn load_from_str(slice: &str) -> Result<Self, Error> {
        let mut config: Configuration = toml::from_str(slice).map_err(|e| {
            println!("Configuration file format error:");
            println!("{e}");
            Error::ConfigurationFileFormat(e.to_string())
        })?;

        if config.upstream.is_none() {
            config.upstream = Some(UpstreamConfig::in_cluster()?);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn upstream(&self) -> Result<&UpstreamConfig, Error> {
        self.upstream
            .as_ref()
            .ok_or_else(|| Error::Validation("upstream configuration is missing".to_string()))
    }

    fn validate(&self) -> Result<(), Error> {
        self.oidc.validate()?;
        self.upstream()?.validate()?;

        if self.server.port == self.probe.port {
            return Err(Error::Validation(format!(
                "unable to serve on port {}, it is used by the readiness probe",
                self.server.port
            )));
        }

        if self.watch.reload_interval < 1 {
            return Err(Error::Validation(format!(
                "expected reload interval to be a second or higher, got={}",
                self.watch.reload_interval
            )));
        }

        if self.global.worker_threads == 0 {
            return Err(Error::Validation(
                "worker_threads must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Files whose modification triggers a credential reload.
    pub fn watched_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = Vec::new();

        if let Some(tls) = &self.server.tls {
            files.push(PathBuf::from(&tls.server_certificate_bundle));
            files.push(PathBuf::from(&tls.server_private_key));
            if let Some(client_ca_bundle) = &tls.client_ca_bundle {
                files.push(PathBuf::from(client_ca_bundle));
            }
        }

        if let Some(token_file) = self.upstream.as_ref().and_then(|u| u.token_file.as_ref()) {
            files.push(token_file.clone());
        }

        for file in &self.watch.files {
            if !files.contains(file) {
                files.push(file.clone());
            }
        }

        files
    }
}
