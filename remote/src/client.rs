use crate::error::RegistryError;
use crate::reference::ImageReference;
use crate::resolver::RegistryHost;
use crate::tls::Credentials;
use crate::types::*;
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Method, Response, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

const DIGEST_HEADER: &str = "docker-content-digest";

/// A single repository on a remote registry, reached through an ordered
/// list of hosts.
pub struct RemoteRepository {
    reference: ImageReference,
    hosts: Vec<RegistryHost>,
    tokens: Arc<RwLock<HashMap<String, String>>>,
}

impl RemoteRepository {
    pub fn new(reference: ImageReference, hosts: Vec<RegistryHost>) -> Self {
        Self {
            reference,
            hosts,
            tokens: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn reference(&self) -> &ImageReference {
        &self.reference
    }

    /// Resolves the reference to the descriptor of its manifest, trying each
    /// resolve-capable host in order.
    pub async fn resolve(&self) -> Result<Descriptor, RegistryError> {
        let mut last_err = None;
        for host in self.hosts.iter().filter(|h| h.capabilities.resolve) {
            match self.resolve_on(host).await {
                Ok(desc) => return Ok(desc),
                Err(e) => {
                    tracing::debug!(host = %host.base_url(), error = %e, "resolve attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| RegistryError::NoResolvableHost(self.reference.name())))
    }

    async fn resolve_on(&self, host: &RegistryHost) -> Result<Descriptor, RegistryError> {
        let url = format!(
            "{}/{}/manifests/{}",
            host.base_url(),
            self.reference.repository,
            self.reference.reference()
        );
        tracing::debug!("Resolving manifest at: {}", url);

        let response = self.request_with_auth(host, Method::HEAD, &url).await?;
        if !response.status().is_success() {
            return Err(RegistryError::ManifestNotFound(format!(
                "{} ({})",
                self.reference.full_name(),
                response.status()
            )));
        }

        let headers = response.headers();
        let media_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(MEDIA_TYPE_OCI_MANIFEST)
            .to_string();
        let size = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let digest = match headers.get(DIGEST_HEADER).and_then(|v| v.to_str().ok()) {
            Some(d) => d.to_string(),
            None => self.reference.digest.clone().ok_or_else(|| {
                RegistryError::Registry(format!(
                    "registry did not report a digest for {}",
                    self.reference.full_name()
                ))
            })?,
        };

        Ok(Descriptor::new(&media_type, &digest, size))
    }

    async fn credentials(&self, host: &RegistryHost) -> Option<Credentials> {
        let authorizer = host.authorizer.as_ref()?;
        match authorizer.credentials(self.reference.host()).await {
            Ok(creds) => Some(creds),
            Err(e) => {
                tracing::debug!(error = %e, "continuing anonymously");
                None
            }
        }
    }

    async fn request_with_auth(
        &self,
        host: &RegistryHost,
        method: Method,
        url: &str,
    ) -> Result<Response, RegistryError> {
        let accept = MANIFEST_ACCEPT.join(", ");
        let key = format!("{}/{}", host.host, self.reference.repository);

        let mut request = host
            .client
            .request(method.clone(), url)
            .header(ACCEPT, accept.as_str());
        if let Some(token) = self.tokens.read().await.get(&key) {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let credentials = self.credentials(host).await;

        let retry = host
            .client
            .request(method, url)
            .header(ACCEPT, accept.as_str());
        let retry = if challenge.to_ascii_lowercase().starts_with("basic") {
            let creds = credentials
                .ok_or_else(|| RegistryError::Unauthenticated(self.reference.host().to_string()))?;
            retry.basic_auth(creds.user_id, Some(creds.password))
        } else {
            let token = self.authenticate(host, &challenge, credentials).await?;
            self.tokens.write().await.insert(key, token.clone());
            retry.bearer_auth(token)
        };

        Ok(retry.send().await?)
    }

    async fn authenticate(
        &self,
        host: &RegistryHost,
        www_auth: &str,
        credentials: Option<Credentials>,
    ) -> Result<String, RegistryError> {
        let realm = extract_auth_param(www_auth, "realm")
            .ok_or_else(|| RegistryError::AuthFailed("no realm in www-authenticate".to_string()))?;
        let service = extract_auth_param(www_auth, "service");
        let scope = extract_auth_param(www_auth, "scope")
            .unwrap_or_else(|| format!("repository:{}:pull", self.reference.repository));

        let mut query = vec![("scope", scope)];
        if let Some(svc) = service {
            query.push(("service", svc));
        }

        tracing::debug!("Authenticating at: {}", realm);

        let mut request = host.client.get(&realm).query(&query);
        if let Some(creds) = credentials {
            request = request.basic_auth(creds.user_id, Some(creds.password));
        }
        let response = request.send().await?;

        if !response.status().is_success() {
            return Err(RegistryError::AuthFailed(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }

        let token_response: TokenResponse = response.json().await?;
        token_response
            .get_token()
            .map(str::to_string)
            .ok_or_else(|| RegistryError::AuthFailed("no token in response".to_string()))
    }
}

fn extract_auth_param(header: &str, param: &str) -> Option<String> {
    let search = format!("{}=\"", param);
    let start = header.find(&search)? + search.len();
    let end = header[start..].find('"')?;
    Some(header[start..start + end].to_string())
}
