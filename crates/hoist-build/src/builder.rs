use crate::auth::CredentialStore;
use crate::context::ContextBuilder;
use crate::daemon::{BuildSubmission, ImageDaemon};
use crate::dependencies::{DependencyResolver, DockerfileDependencies};
use crate::error::{BuildError, BuildResult};
use crate::progress::{UploadReporter, relay};
use crate::request::BuildRequest;
use std::io;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const OPERATION: &str = "docker build";

pub struct ImageBuilder<D, C, R = DockerfileDependencies> {
    daemon: D,
    credentials: C,
    dependencies: R,
}

impl<D, C> ImageBuilder<D, C, DockerfileDependencies>
where
    D: ImageDaemon,
    C: CredentialStore,
{
    pub fn new(daemon: D, credentials: C) -> Self {
        Self {
            daemon,
            credentials,
            dependencies: DockerfileDependencies,
        }
    }
}

impl<D, C, R> ImageBuilder<D, C, R>
where
    D: ImageDaemon,
    C: CredentialStore,
    R: DependencyResolver,
{
    /// Dockerfile の依存解決を差し替える
    pub fn with_dependency_resolver<R2: DependencyResolver>(
        self,
        dependencies: R2,
    ) -> ImageBuilder<D, C, R2> {
        ImageBuilder {
            daemon: self.daemon,
            credentials: self.credentials,
            dependencies,
        }
    }

    pub fn daemon(&self) -> &D {
        &self.daemon
    }

    /// イメージをビルド
    ///
    /// Dockerfile と COPY / ADD が参照するパスだけをコンテキストとして送信し、
    /// デーモンのビルドログを `request.build_out` へ流す。
    pub async fn build_image(
        &self,
        cancel: &CancellationToken,
        mut request: BuildRequest,
    ) -> BuildResult<()> {
        tracing::debug!(
            "Running docker build: context: {}, dockerfile: {}",
            request.context_dir.display(),
            request.dockerfile.display()
        );

        let context_dir = request.resolve_context()?;
        let dockerfile = request.resolve_dockerfile()?;

        // マルチステージでは複数レジストリから pull し得るので全件渡す
        let auth_configs = self
            .credentials
            .all_auth_configs()
            .map_err(BuildError::ReadAuthConfigs)?;

        let dockerfile_path = context_dir.join(&dockerfile);
        let content = std::fs::read_to_string(&dockerfile_path).map_err(|source| {
            BuildError::DockerfileOpen {
                path: dockerfile_path.clone(),
                source,
            }
        })?;

        let dependencies = self
            .dependencies
            .resolve(&context_dir, &content)
            .map_err(BuildError::Dependencies)?;

        // アーカイブ作成はブロッキング I/O なので専用スレッドで行う
        let archive = {
            let context_dir = context_dir.clone();
            let dockerfile = dockerfile.clone();
            let task = tokio::task::spawn_blocking(move || {
                ContextBuilder::create_context(&context_dir, &dockerfile, &dependencies)
            });
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(BuildError::Cancelled { operation: OPERATION });
                }
                joined = task => joined.map_err(|e| BuildError::Archive(io::Error::other(e)))??,
            }
        };

        if cancel.is_cancelled() {
            return Err(BuildError::Cancelled {
                operation: OPERATION,
            });
        }

        let (upload_tx, mut upload_rx) = mpsc::unbounded_channel();
        let mut upload = UploadReporter::new(&request.progress_out, archive.len() as u64);

        let submission = BuildSubmission {
            tag: request.image_name.clone(),
            dockerfile: dockerfile
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/"),
            build_args: request.resolve_build_args(),
            target: request.target.clone(),
            no_cache: request.no_cache,
            auth_configs,
            context: archive,
            upload_progress: Some(upload_tx),
        };

        let build = self.daemon.build(submission);
        tokio::pin!(build);
        let stream = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(BuildError::Cancelled { operation: OPERATION });
                }
                Some(sent) = upload_rx.recv() => upload.advance(sent),
                stream = &mut build => break stream?,
            }
        };

        while let Ok(sent) = upload_rx.try_recv() {
            upload.advance(sent);
        }
        upload.finish(&mut request.progress_out)?;

        relay(OPERATION, stream, &mut request.build_out, cancel).await?;

        tracing::info!("Successfully built: {}", request.image_name);
        Ok(())
    }
}
