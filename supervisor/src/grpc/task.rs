use super::{GrpcSupervisor, api, json_any, to_api_mount};
use crate::client::{IoAttach, IoCreator, SupervisorClient, SupervisorContainer, SupervisorTask, TaskIo};
use crate::error::SupervisorError;
use crate::types::*;
use async_trait::async_trait;
use berth_core::Context;
use oci_spec::runtime::{LinuxResources, Spec};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

pub struct GrpcContainer {
    client: GrpcSupervisor,
    id: String,
}

impl GrpcContainer {
    pub(super) fn new(client: GrpcSupervisor, id: String) -> Self {
        Self { client, id }
    }
}

fn path_string(path: &Option<PathBuf>) -> String {
    path.as_deref()
        .map(Path::to_string_lossy)
        .map(|p| p.into_owned())
        .unwrap_or_default()
}

fn optional_path(path: String) -> Option<PathBuf> {
    Some(path).filter(|p| !p.is_empty()).map(PathBuf::from)
}

pub(super) fn process_status(status: api::Status) -> ProcessStatus {
    match status {
        api::Status::Created => ProcessStatus::Created,
        api::Status::Running => ProcessStatus::Running,
        api::Status::Stopped => ProcessStatus::Stopped,
        api::Status::Paused => ProcessStatus::Paused,
        api::Status::Pausing => ProcessStatus::Pausing,
        api::Status::Unknown => ProcessStatus::Unknown,
    }
}

#[async_trait]
impl SupervisorContainer for GrpcContainer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn spec(&self, ctx: &Context) -> Result<Spec, SupervisorError> {
        let container = self.client.get_container(ctx, &self.id).await?;
        let spec = container
            .spec
            .ok_or_else(|| SupervisorError::OciSpec(format!("container {} has no spec", self.id)))?;
        serde_json::from_slice(&spec.value).map_err(|e| SupervisorError::OciSpec(e.to_string()))
    }

    async fn image(&self, ctx: &Context) -> Result<Image, SupervisorError> {
        let container = self.client.get_container(ctx, &self.id).await?;
        if container.image.is_empty() {
            return Err(SupervisorError::NotFound(format!(
                "container {} has no image",
                self.id
            )));
        }
        self.client.get_image(ctx, &container.image).await
    }

    async fn new_task(
        &self,
        ctx: &Context,
        io: IoCreator,
    ) -> Result<Arc<dyn SupervisorTask>, SupervisorError> {
        let container = self.client.get_container(ctx, &self.id).await?;
        let rootfs = if container.snapshot_key.is_empty() {
            Vec::new()
        } else {
            self.client
                .snapshot_mounts(ctx, &container.snapshotter, &container.snapshot_key)
                .await?
        };

        let task_io = io(self.id.clone()).await?;
        let config = task_io.config();
        let request = api::CreateTaskRequest {
            container_id: self.id.clone(),
            rootfs: rootfs.iter().map(to_api_mount).collect(),
            stdin: path_string(&config.stdin),
            stdout: path_string(&config.stdout),
            stderr: path_string(&config.stderr),
            terminal: config.terminal,
        };
        let created: Result<api::CreateTaskResponse, _> = self
            .client
            .unary(ctx, api::TASKS, "Create", request)
            .await;
        match created {
            Ok(res) => Ok(Arc::new(GrpcTask {
                client: self.client.clone(),
                id: self.id.clone(),
                pid: res.pid,
                io: Some(task_io),
            })),
            Err(e) => {
                task_io.cancel();
                if let Err(close_err) = task_io.close().await {
                    debug!("Closing IO of {} after failed create: {}", self.id, close_err);
                }
                Err(e)
            }
        }
    }

    async fn task(
        &self,
        ctx: &Context,
        io: Option<IoAttach>,
    ) -> Result<Arc<dyn SupervisorTask>, SupervisorError> {
        let res: api::GetTaskResponse = self
            .client
            .unary(
                ctx,
                api::TASKS,
                "Get",
                api::ProcessRequest {
                    container_id: self.id.clone(),
                    exec_id: String::new(),
                },
            )
            .await?;
        let process = res
            .process
            .ok_or_else(|| SupervisorError::NotFound(format!("no running task found: task {}", self.id)))?;
        let task_io = match io {
            Some(attach) => Some(
                attach(IoConfig {
                    stdin: optional_path(process.stdin),
                    stdout: optional_path(process.stdout),
                    stderr: optional_path(process.stderr),
                    terminal: process.terminal,
                })
                .await?,
            ),
            None => None,
        };
        Ok(Arc::new(GrpcTask {
            client: self.client.clone(),
            id: self.id.clone(),
            pid: process.pid,
            io: task_io,
        }))
    }

    async fn delete(&self, ctx: &Context) -> Result<(), SupervisorError> {
        self.client
            .unary::<_, ()>(
                ctx,
                api::CONTAINERS,
                "Delete",
                api::ContainerIdRequest { id: self.id.clone() },
            )
            .await
    }
}

pub struct GrpcTask {
    client: GrpcSupervisor,
    id: String,
    pid: u32,
    io: Option<Arc<dyn TaskIo>>,
}

impl GrpcTask {
    fn process(&self) -> api::ProcessRequest {
        api::ProcessRequest {
            container_id: self.id.clone(),
            exec_id: String::new(),
        }
    }
}

#[async_trait]
impl SupervisorTask for GrpcTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn pid(&self) -> u32 {
        self.pid
    }

    fn io(&self) -> Option<Arc<dyn TaskIo>> {
        self.io.clone()
    }

    async fn start(&self, ctx: &Context) -> Result<(), SupervisorError> {
        let _: api::StartResponse = self
            .client
            .unary(ctx, api::TASKS, "Start", self.process())
            .await?;
        Ok(())
    }

    async fn wait(&self, ctx: &Context) -> Result<oneshot::Receiver<ExitStatus>, SupervisorError> {
        let (tx, rx) = oneshot::channel();
        let client = self.client.clone();
        let request = self.process();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let res: Result<api::WaitResponse, _> =
                client.unary(&ctx, api::TASKS, "Wait", request).await;
            let status = match res {
                Ok(res) => ExitStatus::new(res.exit_status, res.exited_at.unwrap_or_default()),
                Err(SupervisorError::Rpc(status)) => ExitStatus::failed(status),
                Err(SupervisorError::Cancelled(e)) => {
                    ExitStatus::failed(tonic::Status::cancelled(e.to_string()))
                }
                Err(e) => ExitStatus::failed(tonic::Status::unavailable(e.to_string())),
            };
            let _ = tx.send(status);
        });
        Ok(rx)
    }

    async fn kill(&self, ctx: &Context, signal: i32, all: bool) -> Result<(), SupervisorError> {
        let signal = u32::try_from(signal)
            .map_err(|_| SupervisorError::InvalidArgument(format!("signal {}", signal)))?;
        self.client
            .unary::<_, ()>(
                ctx,
                api::TASKS,
                "Kill",
                api::KillRequest {
                    container_id: self.id.clone(),
                    exec_id: String::new(),
                    signal,
                    all,
                },
            )
            .await
    }

    async fn delete(&self, ctx: &Context) -> Result<ExitStatus, SupervisorError> {
        let res: api::DeleteTaskResponse = self
            .client
            .unary(
                ctx,
                api::TASKS,
                "Delete",
                api::TaskIdRequest {
                    container_id: self.id.clone(),
                },
            )
            .await?;
        Ok(ExitStatus::new(
            res.exit_status,
            res.exited_at.unwrap_or_default(),
        ))
    }

    async fn pause(&self, ctx: &Context) -> Result<(), SupervisorError> {
        self.client
            .unary::<_, ()>(
                ctx,
                api::TASKS,
                "Pause",
                api::TaskIdRequest {
                    container_id: self.id.clone(),
                },
            )
            .await
    }

    async fn resume(&self, ctx: &Context) -> Result<(), SupervisorError> {
        self.client
            .unary::<_, ()>(
                ctx,
                api::TASKS,
                "Resume",
                api::TaskIdRequest {
                    container_id: self.id.clone(),
                },
            )
            .await
    }

    async fn status(&self, ctx: &Context) -> Result<ProcessStatus, SupervisorError> {
        let res: api::GetTaskResponse = self
            .client
            .unary(ctx, api::TASKS, "Get", self.process())
            .await?;
        Ok(res
            .process
            .map(|p| process_status(p.status()))
            .unwrap_or(ProcessStatus::Unknown))
    }

    async fn update(&self, ctx: &Context, resources: LinuxResources) -> Result<(), SupervisorError> {
        let request = api::UpdateTaskRequest {
            container_id: self.id.clone(),
            resources: Some(json_any(api::RESOURCES_TYPE_URL, &resources)?),
            annotations: Default::default(),
        };
        self.client
            .unary::<_, ()>(ctx, api::TASKS, "Update", request)
            .await
    }

    async fn metrics(&self, ctx: &Context) -> Result<TaskMetrics, SupervisorError> {
        let res: api::MetricsResponse = self
            .client
            .unary(
                ctx,
                api::TASKS,
                "Metrics",
                api::MetricsRequest {
                    filters: vec![format!("id=={}", self.id)],
                },
            )
            .await?;
        let metric = res
            .metrics
            .into_iter()
            .next()
            .ok_or_else(|| SupervisorError::NotFound(format!("metrics for task {}", self.id)))?;
        Ok(TaskMetrics {
            timestamp: metric.timestamp.unwrap_or_default(),
            id: metric.id,
            data: metric.data,
        })
    }

    async fn close_stdin(&self, ctx: &Context) -> Result<(), SupervisorError> {
        self.client
            .unary::<_, ()>(
                ctx,
                api::TASKS,
                "CloseIO",
                api::CloseIoRequest {
                    container_id: self.id.clone(),
                    exec_id: String::new(),
                    stdin: true,
                },
            )
            .await
    }
}

