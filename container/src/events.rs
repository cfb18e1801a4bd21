//! Supervisor event processing: marks containers killed by the OOM killer.

use crate::cache::ContainerCache;
use berth_core::Context;
use berth_supervisor::{Envelope, SupervisorSpi, TASK_OOM_TOPIC, TASK_OOM_TYPE_URL, TaskOom};
use prost::Message;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Subscription filter selecting the OOM events of `namespace`.
pub fn oom_filter(namespace: &str) -> String {
    format!("namespace=={},topic~=tasks/oom.*", namespace)
}

/// Spawns the processor; it runs until `ctx` is cancelled or the
/// subscription fails.
pub fn spawn_event_processor(
    ctx: Context,
    spi: Arc<SupervisorSpi>,
    cache: ContainerCache,
) -> JoinHandle<()> {
    tokio::spawn(async move { process_events(&ctx, &spi, &cache).await })
}

async fn process_events(ctx: &Context, spi: &SupervisorSpi, cache: &ContainerCache) {
    let namespace = spi.namespace().to_string();
    let mut stream = match spi.subscribe(ctx, vec![oom_filter(&namespace)]).await {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to subscribe to supervisor events: {}", e);
            return;
        }
    };

    loop {
        tokio::select! {
            _ = ctx.cancelled() => return,
            envelope = stream.envelopes.recv() => match envelope {
                Some(envelope) => handle_envelope(cache, &namespace, envelope).await,
                None => {
                    debug!("Event stream closed");
                    return;
                }
            },
            err = stream.errors.recv() => {
                if let Some(e) = err {
                    warn!("Supervisor event stream failed: {}", e);
                }
                return;
            }
        }
    }
}

async fn handle_envelope(cache: &ContainerCache, namespace: &str, envelope: Envelope) {
    if envelope.namespace != namespace || envelope.topic != TASK_OOM_TOPIC {
        return;
    }
    let Some(event) = envelope.event else {
        return;
    };
    if !event.type_url.ends_with(TASK_OOM_TYPE_URL) {
        return;
    }
    let oom = match TaskOom::decode(event.value.as_slice()) {
        Ok(oom) => oom,
        Err(e) => {
            warn!("Failed to decode OOM event: {}", e);
            return;
        }
    };

    match cache.get(&oom.container_id).await {
        Some(info) => {
            info.set_oom_killed(true).await;
            warn!(container_id = %oom.container_id, "Container was OOM killed");
        }
        None => debug!(container_id = %oom.container_id, "OOM event for unknown container"),
    }
}
