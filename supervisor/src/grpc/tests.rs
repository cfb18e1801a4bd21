use super::pull::{auth_response, decrypt_payloads};
use super::task::process_status;
use super::*;
use berth_core::ErrorKind;
use berth_remote::{Credentials, HostsResolver, Platform, RegistryConfig, RegistryResolver};
use prost::Message;
use std::marker::PhantomData;
use std::sync::Mutex;
use std::task::Poll;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::Status;
use tonic::body::BoxBody;
use tonic::codegen::{Body, BoxFuture, Service, StdError, empty_body, http};
use tonic::server::{NamedService, UnaryService};

/// Answers one unary call with a closure.
struct Handler<Res, F>(Option<F>, PhantomData<fn() -> Res>);

impl<Req, Res, F> UnaryService<Req> for Handler<Res, F>
where
    Res: Send + 'static,
    F: FnOnce(tonic::Request<Req>) -> Result<Res, Status> + Send + 'static,
{
    type Response = Res;
    type Future = std::future::Ready<Result<tonic::Response<Res>, Status>>;

    fn call(&mut self, request: tonic::Request<Req>) -> Self::Future {
        let handler = self.0.take().expect("handler called twice");
        std::future::ready(handler(request).map(tonic::Response::new))
    }
}

async fn serve<B, Req, Res, F>(req: http::Request<B>, handler: F) -> http::Response<BoxBody>
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
    Req: prost::Message + Default + Send + 'static,
    Res: prost::Message + Send + 'static,
    F: FnOnce(tonic::Request<Req>) -> Result<Res, Status> + Send + 'static,
{
    let mut grpc = tonic::server::Grpc::new(ProstCodec::<Res, Req>::default());
    grpc.unary(Handler(Some(handler), PhantomData), req).await
}

/// A daemon serving the few calls the tests make and recording them.
#[derive(Clone, Default)]
struct FakeDaemon {
    scopes: Arc<Mutex<Vec<(Option<String>, Option<String>)>>>,
    transfers: Arc<Mutex<Vec<api::TransferRequest>>>,
}

impl FakeDaemon {
    async fn handle<B>(self, req: http::Request<B>) -> http::Response<BoxBody>
    where
        B: Body + Send + 'static,
        B::Error: Into<StdError> + Send + 'static,
    {
        let path = req.uri().path().to_string();
        match path.as_str() {
            "/containerd.services.leases.v1.Leases/Create" => {
                serve(req, move |r: tonic::Request<api::CreateLeaseRequest>| {
                    let header = |name: &str| {
                        r.metadata()
                            .get(name)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string)
                    };
                    self.scopes
                        .lock()
                        .unwrap()
                        .push((header(NAMESPACE_HEADER), header(LEASE_HEADER)));
                    let r = r.into_inner();
                    Ok(api::CreateLeaseResponse {
                        lease: Some(api::Lease {
                            id: r.id,
                            labels: r.labels,
                            created_at: None,
                        }),
                    })
                })
                .await
            }
            "/containerd.services.leases.v1.Leases/Delete" => {
                serve(req, |r: tonic::Request<api::DeleteLeaseRequest>| -> Result<(), Status> {
                    Err(Status::not_found(format!("lease {:?}", r.get_ref().id)))
                })
                .await
            }
            "/containerd.services.transfer.v1.Transfer/Transfer" => {
                serve(req, move |r: tonic::Request<api::TransferRequest>| {
                    self.transfers.lock().unwrap().push(r.into_inner());
                    Ok(())
                })
                .await
            }
            "/containerd.services.images.v1.Images/Get" => {
                serve(req, |r: tonic::Request<api::GetImageRequest>| {
                    Ok(api::GetImageResponse {
                        image: Some(api::Image {
                            name: r.into_inner().name,
                            ..Default::default()
                        }),
                    })
                })
                .await
            }
            _ => {
                let mut response = http::Response::new(empty_body());
                response.headers_mut().insert(
                    "grpc-status",
                    http::HeaderValue::from(tonic::Code::Unimplemented as i32),
                );
                response.headers_mut().insert(
                    http::header::CONTENT_TYPE,
                    http::HeaderValue::from_static("application/grpc"),
                );
                response
            }
        }
    }
}

macro_rules! fake_service {
    ($name:ident, $service:literal) => {
        #[derive(Clone)]
        struct $name(FakeDaemon);

        impl NamedService for $name {
            const NAME: &'static str = $service;
        }

        impl<B> Service<http::Request<B>> for $name
        where
            B: Body + Send + 'static,
            B::Error: Into<StdError> + Send + 'static,
        {
            type Response = http::Response<BoxBody>;
            type Error = std::convert::Infallible;
            type Future = BoxFuture<Self::Response, Self::Error>;

            fn poll_ready(
                &mut self,
                _cx: &mut std::task::Context<'_>,
            ) -> Poll<Result<(), Self::Error>> {
                Poll::Ready(Ok(()))
            }

            fn call(&mut self, req: http::Request<B>) -> Self::Future {
                let daemon = self.0.clone();
                Box::pin(async move { Ok(daemon.handle(req).await) })
            }
        }
    };
}

fake_service!(FakeLeases, "containerd.services.leases.v1.Leases");
fake_service!(FakeTransfer, "containerd.services.transfer.v1.Transfer");
fake_service!(FakeImages, "containerd.services.images.v1.Images");

async fn start(daemon: &FakeDaemon) -> (tempfile::TempDir, GrpcSupervisor) {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("containerd.sock");
    let listener = UnixListener::bind(&socket).unwrap();
    let server = tonic::transport::Server::builder()
        .add_service(FakeLeases(daemon.clone()))
        .add_service(FakeTransfer(daemon.clone()))
        .add_service(FakeImages(daemon.clone()))
        .serve_with_incoming(UnixListenerStream::new(listener));
    tokio::spawn(server);

    let client = GrpcSupervisor::connect(&socket, dir.path().join("hosts"))
        .await
        .unwrap();
    (dir, client)
}

fn insecure_resolver() -> HostsResolver {
    let configs = HashMap::from([(
        "reg.test".to_string(),
        RegistryConfig {
            insecure: true,
            ..Default::default()
        },
    )]);
    RegistryResolver::new(configs)
        .resolver_for("reg.test/app:1")
        .unwrap()
        .unwrap()
}

#[test]
fn test_chain_ids() {
    let a = format!("sha256:{}", "a".repeat(64));
    let b = format!("sha256:{}", "b".repeat(64));
    assert_eq!(
        chain_ids(&[a.clone(), b]),
        vec![
            a.clone(),
            "sha256:ccd722928bd92476ba1745586fed6e45a102504185ad88cd89e01ff116fd146c".to_string()
        ]
    );
    assert_eq!(chain_ids(std::slice::from_ref(&a)), vec![a]);
    assert!(chain_ids(&[]).is_empty());
}

#[test]
fn test_render_hosts_toml() {
    let resolver = insecure_resolver();
    assert_eq!(
        render_hosts_toml(resolver.hosts()),
        r#"server = "http://reg.test"

[host."http://reg.test"]
  capabilities = ["pull", "resolve"]

[host."https://reg.test"]
  capabilities = ["pull", "resolve"]
  skip_verify = true
"#
    );
}

#[test]
fn test_render_hosts_toml_with_certificates() {
    let configs = HashMap::from([(
        "secure.test".to_string(),
        RegistryConfig {
            transport: Some(berth_remote::TlsConfig {
                root_ca: "/etc/certs/ca.crt".to_string(),
                client_cert: "/etc/certs/client.cert".to_string(),
                client_key: "/etc/certs/client.key".to_string(),
            }),
            ..Default::default()
        },
    )]);
    let hosts = RegistryResolver::new(configs).hosts("secure.test").unwrap();
    let rendered = render_hosts_toml(&hosts);
    assert!(rendered.contains(r#"  ca = "/etc/certs/ca.crt""#));
    assert!(rendered.contains(r#"  client = [["/etc/certs/client.cert", "/etc/certs/client.key"]]"#));
    assert!(!rendered.contains("skip_verify"));
}

#[test]
fn test_process_status_mapping() {
    assert_eq!(process_status(api::Status::Running), ProcessStatus::Running);
    assert_eq!(process_status(api::Status::Stopped), ProcessStatus::Stopped);
    assert_eq!(process_status(api::Status::Pausing), ProcessStatus::Pausing);
    assert_eq!(process_status(api::Status::Unknown), ProcessStatus::Unknown);
}

#[test]
fn test_scoped_request_headers() {
    let ctx = Context::background().with_namespace("berth").with_lease("l1");
    let request = scoped_request(&ctx, ()).unwrap();
    assert_eq!(request.metadata().get(NAMESPACE_HEADER).unwrap(), "berth");
    assert_eq!(request.metadata().get(LEASE_HEADER).unwrap(), "l1");

    let request = scoped_request(&ctx.without_lease(), ()).unwrap();
    assert!(request.metadata().get(LEASE_HEADER).is_none());

    let bad = Context::background().with_namespace("bad\nname");
    assert!(scoped_request(&bad, ()).is_err());
}

#[test]
fn test_decrypt_payloads() {
    let decrypt = DecryptPayload {
        parameters: HashMap::from([("privkeys".to_string(), vec![b"key".to_vec()])]),
    };
    let payloads = decrypt_payloads(&decrypt).unwrap();
    assert_eq!(payloads.len(), 2);
    let any = &payloads["io.containerd.ocicrypt.decoder.v1.tar.gzip"];
    assert_eq!(any.type_url, api::DECRYPT_PAYLOAD_TYPE_URL);
    let json: serde_json::Value = serde_json::from_slice(&any.value).unwrap();
    assert_eq!(
        json,
        serde_json::json!({"DecryptConfig": {"Parameters": {"privkeys": ["a2V5"]}}})
    );
}

#[tokio::test]
async fn test_auth_response_uses_registry_credentials() {
    let configs = HashMap::from([(
        "secure.test".to_string(),
        RegistryConfig {
            credentials: Some(Credentials::new("user", "pass")),
            ..Default::default()
        },
    )]);
    let resolver = RegistryResolver::new(configs)
        .resolver_for("secure.test/app:1")
        .unwrap()
        .unwrap();

    let response = auth_response(&resolver, "secure.test").await;
    assert_eq!(response.auth_type(), api::AuthType::Credentials);
    assert_eq!(response.username, "user");
    assert_eq!(response.secret, "pass");

    let response = auth_response(&resolver, "elsewhere.test").await;
    assert_eq!(response.auth_type(), api::AuthType::None);
    assert!(response.secret.is_empty());
}

#[tokio::test]
async fn test_requests_carry_namespace_and_lease() {
    let daemon = FakeDaemon::default();
    let (_dir, client) = start(&daemon).await;

    let ctx = Context::background().with_namespace("berth").with_lease("l1");
    let labels = HashMap::from([("k".to_string(), "v".to_string())]);
    let lease = client.create_lease(&ctx, "l2", labels.clone()).await.unwrap();
    assert_eq!(lease.id, "l2");
    assert_eq!(lease.labels, labels);
    assert_eq!(
        daemon.scopes.lock().unwrap().as_slice(),
        &[(Some("berth".to_string()), Some("l1".to_string()))]
    );
}

#[tokio::test]
async fn test_status_codes_map_to_kinds() {
    let daemon = FakeDaemon::default();
    let (_dir, client) = start(&daemon).await;
    let ctx = Context::background().with_namespace("berth");

    let err = client.delete_lease(&ctx, "gone", false).await.unwrap_err();
    assert!(err.is_not_found());

    let err = client.list_images(&ctx).await.unwrap_err();
    assert!(matches!(err, SupervisorError::Rpc(ref s) if s.code() == tonic::Code::Unimplemented));
}

#[tokio::test]
async fn test_closed_client_fails_fast() {
    let daemon = FakeDaemon::default();
    let (_dir, client) = start(&daemon).await;
    client.close().await.unwrap();

    let ctx = Context::background().with_namespace("berth");
    let err = client
        .create_lease(&ctx, "l1", HashMap::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert!(daemon.scopes.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_connect_missing_socket() {
    let dir = tempfile::tempdir().unwrap();
    let err = GrpcSupervisor::connect(dir.path().join("missing.sock"), dir.path())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, SupervisorError::Transport(_)));
    assert_eq!(err.kind(), ErrorKind::Transport);
}

#[tokio::test]
async fn test_pull_through_transfer_service() {
    let daemon = FakeDaemon::default();
    let (dir, client) = start(&daemon).await;
    let ctx = Context::background().with_namespace("berth");
    let resolver = insecure_resolver();
    let opts = PullOptions {
        resolver: Some(resolver.clone()),
        platform: Platform {
            os: "linux".to_string(),
            architecture: "amd64".to_string(),
            ..Default::default()
        },
        unpack: true,
        snapshotter: "overlayfs".to_string(),
        decrypt: None,
    };

    let image = client
        .pull_image(&ctx, "reg.test/app:1", opts)
        .await
        .unwrap();
    assert_eq!(image.name, "reg.test/app:1");

    let hosts_dir = dir.path().join("hosts");
    let written = std::fs::read_to_string(hosts_dir.join("reg.test/hosts.toml")).unwrap();
    assert_eq!(written, render_hosts_toml(resolver.hosts()));

    let transfers = daemon.transfers.lock().unwrap();
    assert_eq!(transfers.len(), 1);
    let source = transfers[0].source.as_ref().unwrap();
    assert_eq!(source.type_url, api::OCI_REGISTRY_TYPE_URL);
    let source = api::OciRegistry::decode(source.value.as_slice()).unwrap();
    assert_eq!(source.reference, "reg.test/app:1");
    let source_resolver = source.resolver.unwrap();
    assert_eq!(source_resolver.host_dir, hosts_dir.display().to_string());
    assert_eq!(source_resolver.default_scheme, "http");
    assert!(source_resolver.auth_stream.is_empty());

    let destination = transfers[0].destination.as_ref().unwrap();
    let destination = api::ImageStore::decode(destination.value.as_slice()).unwrap();
    assert_eq!(destination.name, "reg.test/app:1");
    assert_eq!(destination.platforms[0].architecture, "amd64");
    assert_eq!(destination.unpacks.len(), 1);
    assert_eq!(destination.unpacks[0].snapshotter, "overlayfs");
}
