use super::{GrpcSupervisor, api, scoped_request, method_path, to_api_descriptor, to_api_mount};
use crate::client::SupervisorClient;
use crate::error::SupervisorError;
use crate::types::*;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use berth_core::Context;
use berth_remote::platform::{MatchComparer, Only};
use berth_remote::{
    Descriptor, HostsResolver, ImageIndex, ImageManifest, Platform, RegistryHost, is_index,
};
use prost::Message;
use prost_types::{Any, FieldMask};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::codec::ProstCodec;
use tracing::{debug, info, warn};

const SNAPSHOT_REF_LABEL: &str = "containerd.io/snapshot.ref";
const GC_REF_SNAPSHOT_PREFIX: &str = "containerd.io/gc.ref.snapshot.";

/// Lifetime of the lease protecting an unpack that runs without one.
const UNPACK_LEASE_EXPIRY: Duration = Duration::from_secs(60 * 60);

/// Stream processors handed the decryption keys when a layer is applied.
const DECRYPT_PAYLOAD_KEYS: [&str; 2] = [
    "io.containerd.ocicrypt.decoder.v1.tar",
    "io.containerd.ocicrypt.decoder.v1.tar.gzip",
];

/// Chain IDs of a layer stack: the first is the first diff ID, each later one
/// digests its parent's chain ID and its own diff ID.
pub fn chain_ids(diff_ids: &[String]) -> Vec<String> {
    let mut chain: Vec<String> = Vec::with_capacity(diff_ids.len());
    for diff_id in diff_ids {
        let next = match chain.last() {
            None => diff_id.clone(),
            Some(parent) => {
                let digest = Sha256::digest(format!("{} {}", parent, diff_id).as_bytes());
                format!("sha256:{:x}", digest)
            }
        };
        chain.push(next);
    }
    chain
}

fn toml_string(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Renders the registry host configuration the daemon reads for a pull.
pub fn render_hosts_toml(hosts: &[RegistryHost]) -> String {
    let mut out = String::new();
    if let Some(first) = hosts.first() {
        let _ = writeln!(
            out,
            "server = {}",
            toml_string(&format!("{}://{}", first.scheme, first.host))
        );
    }
    for host in hosts {
        let mut capabilities = Vec::new();
        if host.capabilities.pull {
            capabilities.push("\"pull\"");
        }
        if host.capabilities.resolve {
            capabilities.push("\"resolve\"");
        }
        if host.capabilities.push {
            capabilities.push("\"push\"");
        }
        let _ = writeln!(
            out,
            "\n[host.{}]",
            toml_string(&format!("{}://{}", host.scheme, host.host))
        );
        let _ = writeln!(out, "  capabilities = [{}]", capabilities.join(", "));
        if host.skip_verify {
            let _ = writeln!(out, "  skip_verify = true");
        }
        if let Some(tls) = &host.tls {
            let _ = writeln!(out, "  ca = {}", toml_string(&tls.root_ca));
            let _ = writeln!(
                out,
                "  client = [[{}, {}]]",
                toml_string(&tls.client_cert),
                toml_string(&tls.client_key)
            );
        }
    }
    out
}

async fn write_hosts_file(dir: &Path, resolver: &HostsResolver) -> Result<(), SupervisorError> {
    let host_dir = dir.join(resolver.host());
    tokio::fs::create_dir_all(&host_dir).await?;
    let tmp = host_dir.join(format!(".hosts.toml.{}", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, render_hosts_toml(resolver.hosts())).await?;
    tokio::fs::rename(&tmp, host_dir.join("hosts.toml")).await?;
    Ok(())
}

fn to_api_platform(platform: &Platform) -> api::Platform {
    api::Platform {
        os: platform.os.clone(),
        architecture: platform.architecture.clone(),
        variant: platform.variant.clone().unwrap_or_default(),
    }
}

/// Answers the daemon's credential requests for one pull over the streaming
/// service. Returns the stream ID to name in the resolver.
async fn start_auth_stream(
    client: &GrpcSupervisor,
    ctx: &Context,
    resolver: HostsResolver,
) -> Result<String, SupervisorError> {
    client.check_open()?;
    let id = uuid::Uuid::new_v4().to_string();
    let (tx, rx) = mpsc::channel::<Any>(4);
    let init = api::any(api::STREAM_INIT_TYPE_URL, &api::StreamInit { id: id.clone() });
    let _ = tx.send(init).await;

    let request = scoped_request(ctx, ReceiverStream::new(rx))?;
    let path = method_path(api::STREAMING, "Stream")?;
    let mut grpc = client.inner.grpc.clone();
    let mut responses = ctx
        .run(async {
            grpc.ready().await?;
            let response = grpc
                .streaming(request, path, ProstCodec::<Any, Any>::default())
                .await?;
            Ok::<_, SupervisorError>(response.into_inner())
        })
        .await?;
    // The first message acknowledges the stream registration.
    ctx.run(async { Ok::<_, SupervisorError>(responses.message().await?) })
        .await?;

    let ctx = ctx.clone();
    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                biased;
                _ = ctx.cancelled() => break,
                next = responses.message() => next,
            };
            let any = match next {
                Ok(Some(any)) => any,
                Ok(None) => break,
                Err(status) => {
                    debug!("Auth stream ended: {}", status);
                    break;
                }
            };
            let request = match api::AuthRequest::decode(any.value.as_slice()) {
                Ok(request) => request,
                Err(e) => {
                    warn!("Ignoring malformed auth request: {}", e);
                    continue;
                }
            };
            let response = auth_response(&resolver, &request.host).await;
            if tx
                .send(api::any(api::AUTH_RESPONSE_TYPE_URL, &response))
                .await
                .is_err()
            {
                break;
            }
        }
    });
    Ok(id)
}

/// Credentials are keyed by the configured registry name, which differs from
/// the endpoint the daemon asks about for the default registry.
pub(super) async fn auth_response(resolver: &HostsResolver, host: &str) -> api::AuthResponse {
    let known = resolver.host() == host || resolver.hosts().iter().any(|h| h.host == host);
    let authorizer = resolver.hosts().iter().find_map(|h| h.authorizer.clone());
    let Some(authorizer) = authorizer.filter(|_| known) else {
        return api::AuthResponse::default();
    };
    match authorizer.credentials(resolver.host()).await {
        Ok(creds) => api::AuthResponse {
            auth_type: api::AuthType::Credentials as i32,
            username: creds.user_id,
            secret: creds.password,
            ..Default::default()
        },
        Err(e) => {
            debug!("No credentials for {}: {}", host, e);
            api::AuthResponse::default()
        }
    }
}

/// Pulls `name` through the daemon's transfer service. Encrypted images are
/// fetched without unpacking and then unpacked here with the keys.
pub(super) async fn pull(
    client: &GrpcSupervisor,
    ctx: &Context,
    name: &str,
    opts: PullOptions,
) -> Result<Image, SupervisorError> {
    let auth_ctx = ctx.child();
    let mut resolver = api::RegistryResolver::default();
    if let Some(hosts) = &opts.resolver {
        write_hosts_file(&client.inner.hosts_dir, hosts).await?;
        resolver.host_dir = client.inner.hosts_dir.display().to_string();
        if let Some(first) = hosts.hosts().first() {
            resolver.default_scheme = first.scheme.to_string();
        }
        if hosts.hosts().iter().any(|h| h.authorizer.is_some()) {
            resolver.auth_stream =
                start_auth_stream(client, &auth_ctx, hosts.clone()).await?;
        }
    }

    let platform = to_api_platform(&opts.platform);
    let unpack_remotely = opts.unpack && opts.decrypt.is_none();
    let source = api::OciRegistry {
        reference: name.to_string(),
        resolver: Some(resolver),
    };
    let destination = api::ImageStore {
        name: name.to_string(),
        platforms: vec![platform.clone()],
        unpacks: if unpack_remotely {
            vec![api::UnpackConfiguration {
                platform: Some(platform),
                snapshotter: opts.snapshotter.clone(),
            }]
        } else {
            Vec::new()
        },
        ..Default::default()
    };
    let transferred = client
        .unary::<_, ()>(
            ctx,
            api::TRANSFER,
            "Transfer",
            api::TransferRequest {
                source: Some(api::any(api::OCI_REGISTRY_TYPE_URL, &source)),
                destination: Some(api::any(api::IMAGE_STORE_TYPE_URL, &destination)),
            },
        )
        .await;
    auth_ctx.cancel();
    transferred?;

    let image = client.get_image(ctx, name).await?;
    if opts.unpack && opts.decrypt.is_some() {
        unpack(client, ctx, &image, &opts.snapshotter, opts.decrypt.as_ref()).await?;
    }
    Ok(image)
}

#[derive(Deserialize)]
struct ConfigRootFs {
    rootfs: RootFs,
}

#[derive(Deserialize)]
struct RootFs {
    #[serde(default)]
    diff_ids: Vec<String>,
}

pub(super) struct ImageLayers {
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    pub diff_ids: Vec<String>,
}

fn decode_json<T: for<'de> Deserialize<'de>>(what: &str, data: &[u8]) -> Result<T, SupervisorError> {
    serde_json::from_slice(data)
        .map_err(|e| SupervisorError::InvalidArgument(format!("invalid {}: {}", what, e)))
}

/// Manifest of `image` for the host platform, with its layers and diff IDs.
pub(super) async fn image_layers(
    client: &GrpcSupervisor,
    ctx: &Context,
    image: &Image,
) -> Result<ImageLayers, SupervisorError> {
    let mut target = image.target.clone();
    if is_index(&target.media_type) {
        let index: ImageIndex = decode_json("index", &client.read_blob(ctx, &target).await?)?;
        let comparer = Only::new(&Platform::current());
        let mut best: Option<&Descriptor> = None;
        for desc in &index.manifests {
            let Some(platform) = &desc.platform else {
                continue;
            };
            if !comparer.matches(platform) {
                continue;
            }
            let better = match best.and_then(|b| b.platform.as_ref()) {
                Some(current) => comparer.less(platform, current),
                None => true,
            };
            if better {
                best = Some(desc);
            }
        }
        target = best.cloned().ok_or_else(|| {
            SupervisorError::NotFound(format!("no manifest for the host platform in {}", image.name))
        })?;
    }

    let manifest: ImageManifest = decode_json("manifest", &client.read_blob(ctx, &target).await?)?;
    let config: ConfigRootFs =
        decode_json("image config", &client.read_blob(ctx, &manifest.config).await?)?;
    if config.rootfs.diff_ids.len() != manifest.layers.len() {
        return Err(SupervisorError::InvalidArgument(format!(
            "image {} has {} layers but {} diff IDs",
            image.name,
            manifest.layers.len(),
            config.rootfs.diff_ids.len()
        )));
    }
    Ok(ImageLayers {
        config: manifest.config,
        layers: manifest.layers,
        diff_ids: config.rootfs.diff_ids,
    })
}

#[derive(Serialize)]
struct DecryptConfig {
    #[serde(rename = "Parameters")]
    parameters: HashMap<String, Vec<String>>,
}

#[derive(Serialize)]
struct DecryptPayloadJson {
    #[serde(rename = "DecryptConfig")]
    decrypt_config: DecryptConfig,
}

pub(super) fn decrypt_payloads(decrypt: &DecryptPayload) -> Result<HashMap<String, Any>, SupervisorError> {
    let payload = DecryptPayloadJson {
        decrypt_config: DecryptConfig {
            parameters: decrypt
                .parameters
                .iter()
                .map(|(k, values)| (k.clone(), values.iter().map(|v| STANDARD.encode(v)).collect()))
                .collect(),
        },
    };
    let any = Any {
        type_url: api::DECRYPT_PAYLOAD_TYPE_URL.to_string(),
        value: serde_json::to_vec(&payload)
            .map_err(|e| SupervisorError::Internal(e.to_string()))?,
    };
    Ok(DECRYPT_PAYLOAD_KEYS
        .iter()
        .map(|k| (k.to_string(), any.clone()))
        .collect())
}

/// Unpacks every missing layer of `image` into `snapshotter`, then points
/// the config blob at the top snapshot so it is kept alive.
pub(super) async fn unpack(
    client: &GrpcSupervisor,
    ctx: &Context,
    image: &Image,
    snapshotter: &str,
    decrypt: Option<&DecryptPayload>,
) -> Result<(), SupervisorError> {
    let layers = image_layers(client, ctx, image).await?;
    let payloads = decrypt.map(decrypt_payloads).transpose()?.unwrap_or_default();

    let temporary_lease = if ctx.lease().is_none() {
        let id = format!("unpack-{}", uuid::Uuid::new_v4().simple());
        let expire = chrono::Utc::now()
            + chrono::Duration::from_std(UNPACK_LEASE_EXPIRY).unwrap_or_default();
        let labels = HashMap::from([(GC_EXPIRE_LABEL.to_string(), expire.to_rfc3339())]);
        client.create_lease(ctx, &id, labels).await?;
        Some(id)
    } else {
        None
    };
    let leased = match &temporary_lease {
        Some(id) => ctx.with_lease(id.clone()),
        None => ctx.clone(),
    };

    let res = unpack_layers(client, &leased, image, snapshotter, &layers, &payloads).await;
    if let Some(id) = temporary_lease {
        if let Err(e) = client.delete_lease(&ctx.without_lease(), &id, false).await {
            warn!("Failed to delete unpack lease {}: {}", id, e);
        }
    }
    res
}

async fn unpack_layers(
    client: &GrpcSupervisor,
    ctx: &Context,
    image: &Image,
    snapshotter: &str,
    layers: &ImageLayers,
    payloads: &HashMap<String, Any>,
) -> Result<(), SupervisorError> {
    let chain = chain_ids(&layers.diff_ids);
    let mut parent = String::new();
    for (i, layer) in layers.layers.iter().enumerate() {
        let chain_id = &chain[i];
        match client.stat_snapshot(ctx, snapshotter, chain_id).await {
            Ok(_) => {
                parent = chain_id.clone();
                continue;
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        apply_layer(
            client,
            ctx,
            snapshotter,
            layer,
            &layers.diff_ids[i],
            chain_id,
            &parent,
            payloads,
        )
        .await?;
        parent = chain_id.clone();
    }

    let Some(top) = chain.last() else {
        return Ok(());
    };
    let label = format!("{}{}", GC_REF_SNAPSHOT_PREFIX, snapshotter);
    let update = api::UpdateContentRequest {
        info: Some(api::ContentInfo {
            digest: layers.config.digest.clone(),
            labels: HashMap::from([(label.clone(), top.clone())]),
            ..Default::default()
        }),
        update_mask: Some(FieldMask {
            paths: vec![format!("labels.{}", label)],
        }),
    };
    let _: api::UpdateContentResponse = client.unary(ctx, api::CONTENT, "Update", update).await?;
    info!("Unpacked image {} into {}", image.name, snapshotter);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn apply_layer(
    client: &GrpcSupervisor,
    ctx: &Context,
    snapshotter: &str,
    layer: &Descriptor,
    diff_id: &str,
    chain_id: &str,
    parent: &str,
    payloads: &HashMap<String, Any>,
) -> Result<(), SupervisorError> {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let key = format!("extract-{} {}", nanos, chain_id);
    let labels = HashMap::from([(SNAPSHOT_REF_LABEL.to_string(), chain_id.to_string())]);
    let mounts = client
        .prepare_with_labels(ctx, snapshotter, &key, parent, labels)
        .await?;

    let res = async {
        let applied: api::ApplyResponse = client
            .unary(
                ctx,
                api::DIFF,
                "Apply",
                api::ApplyRequest {
                    diff: Some(to_api_descriptor(layer)),
                    mounts: mounts.iter().map(to_api_mount).collect(),
                    payloads: payloads.clone(),
                },
            )
            .await?;
        let digest = applied.applied.map(|d| d.digest).unwrap_or_default();
        if digest != diff_id {
            return Err(SupervisorError::InvalidArgument(format!(
                "wrong diff id calculated on extraction {:?}, expected {:?}",
                digest, diff_id
            )));
        }
        client
            .unary::<_, ()>(
                ctx,
                api::SNAPSHOTS,
                "Commit",
                api::CommitSnapshotRequest {
                    snapshotter: snapshotter.to_string(),
                    name: chain_id.to_string(),
                    key: key.clone(),
                    labels: HashMap::new(),
                },
            )
            .await
    }
    .await;

    match res {
        Ok(()) => Ok(()),
        Err(e) => {
            if let Err(remove_err) = client.remove_snapshot(ctx, snapshotter, &key).await {
                debug!("Failed to remove snapshot {}: {}", key, remove_err);
            }
            // Another unpack committed the same layer first.
            if e.is_already_exists() { Ok(()) } else { Err(e) }
        }
    }
}
