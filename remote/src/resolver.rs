use crate::error::RegistryError;
use crate::reference::{DEFAULT_REGISTRY, ImageReference};
use crate::tls::{Credentials, RegistryConfig, TlsConfig};
use async_trait::async_trait;
use reqwest::tls::Version;
use reqwest::{Certificate, Client, ClientBuilder, Identity};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Connection settings shared by every registry client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSettings {
    pub dial_timeout: Duration,
    pub tls_handshake_timeout: Duration,
    pub keep_alive: Duration,
    pub max_idle_conns: usize,
    pub idle_conn_timeout: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(30),
            tls_handshake_timeout: Duration::from_secs(10),
            keep_alive: Duration::from_secs(30),
            max_idle_conns: 10,
            idle_conn_timeout: Duration::from_secs(30),
        }
    }
}

impl TransportSettings {
    /// Bound on establishing a connection. The connector covers the TCP dial
    /// and the TLS handshake in one step, so both budgets apply to it.
    /// Request bodies are sent without `Expect: 100-continue`, so there is no
    /// continue wait to bound.
    pub fn connect_timeout(&self) -> Duration {
        self.dial_timeout + self.tls_handshake_timeout
    }

    /// A builder with the shared transport defaults and TLS 1.2 to 1.3 over
    /// the system root pool.
    pub fn builder(&self) -> ClientBuilder {
        Client::builder()
            .user_agent(concat!("berth/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(self.connect_timeout())
            .tcp_keepalive(self.keep_alive)
            .pool_max_idle_per_host(self.max_idle_conns)
            .pool_idle_timeout(self.idle_conn_timeout)
            .use_rustls_tls()
            .tls_built_in_root_certs(true)
            .min_tls_version(Version::TLS_1_2)
            .max_tls_version(Version::TLS_1_3)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Http => write!(f, "http"),
            Scheme::Https => write!(f, "https"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCapabilities {
    pub pull: bool,
    pub resolve: bool,
    pub push: bool,
}

impl HostCapabilities {
    pub const PULL_RESOLVE: HostCapabilities = HostCapabilities {
        pull: true,
        resolve: true,
        push: false,
    };
}

/// Looks up registry credentials on demand.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Credentials for `host`, or [`RegistryError::Unauthenticated`].
    async fn credentials(&self, host: &str) -> Result<Credentials, RegistryError>;
}

/// Serves the credentials from the registry configuration.
#[derive(Debug, Default)]
pub struct StaticAuthorizer {
    credentials: HashMap<String, Credentials>,
}

impl StaticAuthorizer {
    pub fn new(credentials: HashMap<String, Credentials>) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn credentials(&self, host: &str) -> Result<Credentials, RegistryError> {
        self.credentials
            .get(host)
            .cloned()
            .ok_or_else(|| RegistryError::Unauthenticated(host.to_string()))
    }
}

/// One endpoint able to serve a registry, in order of preference.
#[derive(Clone)]
pub struct RegistryHost {
    pub host: String,
    pub scheme: Scheme,
    pub path: String,
    pub client: Client,
    pub capabilities: HostCapabilities,
    pub authorizer: Option<Arc<dyn Authorizer>>,
    /// Certificate verification is off for this endpoint.
    pub skip_verify: bool,
    /// Custom CA and client certificate the endpoint is reached with.
    pub tls: Option<TlsConfig>,
}

impl RegistryHost {
    pub fn base_url(&self) -> String {
        format!("{}://{}{}", self.scheme, self.host, self.path)
    }
}

impl fmt::Debug for RegistryHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryHost")
            .field("url", &self.base_url())
            .field("capabilities", &self.capabilities)
            .field("authorizer", &self.authorizer.is_some())
            .field("skip_verify", &self.skip_verify)
            .finish()
    }
}

/// The ordered host list for one registry.
#[derive(Debug, Clone)]
pub struct HostsResolver {
    host: String,
    hosts: Vec<RegistryHost>,
}

impl HostsResolver {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn hosts(&self) -> &[RegistryHost] {
        &self.hosts
    }
}

/// Materializes registry hosts from the per-registry configuration.
pub struct RegistryResolver {
    configs: HashMap<String, RegistryConfig>,
    authorizer: Arc<StaticAuthorizer>,
    settings: TransportSettings,
}

impl RegistryResolver {
    pub fn new(configs: HashMap<String, RegistryConfig>) -> Self {
        let credentials = configs
            .iter()
            .filter_map(|(host, cfg)| cfg.credentials.clone().map(|c| (host.clone(), c)))
            .collect();
        Self {
            configs,
            authorizer: Arc::new(StaticAuthorizer::new(credentials)),
            settings: TransportSettings::default(),
        }
    }

    pub fn config(&self, host: &str) -> Option<&RegistryConfig> {
        self.configs.get(host)
    }

    /// Resolver for the registry of `image_ref`; `None` for registries without
    /// configuration, which are then accessed anonymously with defaults.
    pub fn resolver_for(&self, image_ref: &str) -> Result<Option<HostsResolver>, RegistryError> {
        let reference = ImageReference::parse(image_ref)?;
        if !self.configs.contains_key(reference.host()) {
            return Ok(None);
        }
        Ok(Some(HostsResolver {
            host: reference.host().to_string(),
            hosts: self.hosts(reference.host())?,
        }))
    }

    /// Host entries for `host`, HTTP before HTTPS for insecure registries.
    pub fn hosts(&self, host: &str) -> Result<Vec<RegistryHost>, RegistryError> {
        let default_cfg = RegistryConfig::default();
        let cfg = self.configs.get(host).unwrap_or(&default_cfg);
        let endpoint = if host == DEFAULT_REGISTRY {
            "registry-1.docker.io"
        } else {
            host
        };
        let authorizer: Option<Arc<dyn Authorizer>> = cfg
            .credentials
            .as_ref()
            .map(|_| self.authorizer.clone() as Arc<dyn Authorizer>);

        let entry = |scheme, client, skip_verify, tls| RegistryHost {
            host: endpoint.to_string(),
            scheme,
            path: "/v2".to_string(),
            client,
            capabilities: HostCapabilities::PULL_RESOLVE,
            authorizer: authorizer.clone(),
            skip_verify,
            tls,
        };

        if cfg.insecure {
            if cfg.transport.is_some() {
                tracing::warn!(
                    host = %host,
                    "registry is marked insecure, ignoring its TLS configuration"
                );
            }
            let plain = self.settings.builder().build()?;
            let skip_verify = self
                .settings
                .builder()
                .danger_accept_invalid_certs(true)
                .build()?;
            return Ok(vec![
                entry(Scheme::Http, plain, false, None),
                entry(Scheme::Https, skip_verify, true, None),
            ]);
        }

        Ok(vec![entry(
            Scheme::Https,
            self.secure_client(host, cfg.transport.as_ref())?,
            false,
            cfg.transport.clone(),
        )])
    }

    fn secure_client(&self, host: &str, tls: Option<&TlsConfig>) -> Result<Client, RegistryError> {
        if let Some(tls) = tls {
            match with_tls_files(self.settings.builder(), tls).and_then(|b| Ok(b.build()?)) {
                Ok(client) => return Ok(client),
                Err(e) => tracing::warn!(
                    host = %host,
                    error = %e,
                    "failed to load registry TLS configuration, using default TLS"
                ),
            }
        }
        Ok(self.settings.builder().build()?)
    }
}

fn with_tls_files(builder: ClientBuilder, tls: &TlsConfig) -> Result<ClientBuilder, RegistryError> {
    let root_ca = Certificate::from_pem(&std::fs::read(&tls.root_ca)?)?;

    let mut identity_pem = std::fs::read(&tls.client_cert)?;
    identity_pem.push(b'\n');
    identity_pem.extend(std::fs::read(&tls.client_key)?);
    let identity = Identity::from_pem(&identity_pem)?;

    Ok(builder.add_root_certificate(root_ca).identity(identity))
}
