//! Docker デーモンとの通信
//!
//! ビルド・プッシュ・イメージ一覧の3操作だけを `ImageDaemon` として切り出し、
//! Bollard による実装 `DockerDaemon` を提供します。

use crate::error::{BuildError, BuildResult};
use crate::reference::ImageReference;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::models::{BuildInfo, PushImageInfo};
use bollard::query_parameters::{BuildImageOptions, ListImagesOptions, PushImageOptions};
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use std::collections::HashMap;
use tokio::sync::mpsc::UnboundedSender;

/// デーモンから届くステータスイベントのストリーム（1回だけ消費する）
pub type StatusStream<'a> = BoxStream<'a, BuildResult<StatusEvent>>;

/// ビルドコンテキストを送るときのチャンクサイズ
const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// 進捗メッセージ
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressUpdate {
    /// レイヤーIDなど
    pub id: Option<String>,
    pub status: Option<String>,
    /// プログレスバー文字列
    pub progress: Option<String>,
    /// ビルドステップの生出力
    pub stream: Option<String>,
}

/// デーモンが返すイベント1件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    Progress(ProgressUpdate),
    /// 以降のイベントは来ない
    Error { message: String },
}

impl StatusEvent {
    pub fn stream(text: impl Into<String>) -> Self {
        StatusEvent::Progress(ProgressUpdate {
            stream: Some(text.into()),
            ..Default::default()
        })
    }

    pub fn status(id: Option<&str>, status: impl Into<String>, progress: Option<&str>) -> Self {
        StatusEvent::Progress(ProgressUpdate {
            id: id.map(str::to_string),
            status: Some(status.into()),
            progress: progress.map(str::to_string),
            stream: None,
        })
    }

    pub fn error(message: impl Into<String>) -> Self {
        StatusEvent::Error {
            message: message.into(),
        }
    }
}

impl From<BuildInfo> for StatusEvent {
    fn from(info: BuildInfo) -> Self {
        let detail = info.error_detail.and_then(|d| d.message);
        if let Some(message) = detail.or(info.error) {
            return StatusEvent::Error { message };
        }

        StatusEvent::Progress(ProgressUpdate {
            id: info.id,
            status: info.status,
            progress: info.progress,
            stream: info.stream,
        })
    }
}

impl From<PushImageInfo> for StatusEvent {
    fn from(info: PushImageInfo) -> Self {
        if let Some(message) = info.error {
            return StatusEvent::Error { message };
        }

        StatusEvent::Progress(ProgressUpdate {
            id: None,
            status: info.status,
            progress: info.progress,
            stream: None,
        })
    }
}

/// ビルドリクエストの内容
#[derive(Debug, Clone)]
pub struct BuildSubmission {
    pub tag: String,
    /// コンテキスト内の Dockerfile パス（`/` 区切り）
    pub dockerfile: String,
    pub build_args: HashMap<String, String>,
    pub target: Option<String>,
    pub no_cache: bool,
    /// 認証設定キー（レジストリホスト、Docker Hub は旧来のキー） -> 認証情報
    pub auth_configs: HashMap<String, DockerCredentials>,
    /// tar.gz のビルドコンテキスト
    pub context: Vec<u8>,
    /// 送信済みバイト数の通知先
    pub upload_progress: Option<UnboundedSender<usize>>,
}

/// イメージ一覧の1件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageEntry {
    pub id: String,
    pub repo_tags: Vec<String>,
}

/// イメージデーモンの操作
///
/// 1回の呼び出しで1リクエストを送る。リトライはしない。
#[allow(async_fn_in_trait)]
pub trait ImageDaemon {
    /// ビルドを開始し、ステータスイベントのストリームを返す
    async fn build(&self, submission: BuildSubmission) -> BuildResult<StatusStream<'_>>;

    /// プッシュを開始し、ステータスイベントのストリームを返す
    ///
    /// `credentials` は参照先レジストリの認証情報のみ
    async fn push(
        &self,
        reference: &ImageReference,
        credentials: Option<DockerCredentials>,
    ) -> BuildResult<StatusStream<'_>>;

    /// `reference` フィルタに一致するイメージ一覧
    async fn list_images(&self, reference_filter: &str) -> BuildResult<Vec<ImageEntry>>;
}

/// Bollard を使った `ImageDaemon` 実装
#[derive(Debug, Clone)]
pub struct DockerDaemon {
    docker: Docker,
}

impl DockerDaemon {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// ローカルのデフォルト設定（DOCKER_HOST など）で接続し、疎通を確認
    pub async fn connect() -> BuildResult<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        docker.ping().await?;
        tracing::debug!("Connected to Docker daemon");
        Ok(Self { docker })
    }

    pub fn docker(&self) -> &Docker {
        &self.docker
    }
}

impl ImageDaemon for DockerDaemon {
    async fn build(&self, submission: BuildSubmission) -> BuildResult<StatusStream<'_>> {
        tracing::info!("Building image: {}", submission.tag);

        let options = BuildImageOptions {
            dockerfile: submission.dockerfile,
            t: Some(submission.tag.clone()),
            buildargs: Some(submission.build_args),
            target: submission.target.unwrap_or_default(),
            nocache: submission.no_cache,
            rm: true, // 中間コンテナを削除
            ..Default::default()
        };
        tracing::debug!("Build options: {:?}", options);

        let body = upload_body(submission.context, submission.upload_progress);
        let stream = self.docker.build_image(
            options,
            Some(submission.auth_configs),
            Some(bollard::body_stream(body)),
        );

        start_stream("docker build", submission.tag, stream).await
    }

    async fn push(
        &self,
        reference: &ImageReference,
        credentials: Option<DockerCredentials>,
    ) -> BuildResult<StatusStream<'_>> {
        tracing::info!("Pushing image: {}", reference);

        let options = PushImageOptions {
            tag: Some(reference.tag_or_latest().to_string()),
            ..Default::default()
        };

        let stream = self
            .docker
            .push_image(reference.repository(), Some(options), credentials);

        start_stream(
            "pushing image to repository",
            reference.with_default_tag(),
            stream,
        )
        .await
    }

    async fn list_images(&self, reference_filter: &str) -> BuildResult<Vec<ImageEntry>> {
        let mut filters = HashMap::new();
        filters.insert("reference".to_string(), vec![reference_filter.to_string()]);

        let options = ListImagesOptions {
            filters: Some(filters),
            ..Default::default()
        };

        let images = self
            .docker
            .list_images(Some(options))
            .await
            .map_err(BuildError::ImageList)?;

        Ok(images
            .into_iter()
            .map(|image| ImageEntry {
                id: image.id,
                repo_tags: image.repo_tags,
            })
            .collect())
    }
}

/// ビルドコンテキストをチャンクに分けて送り、送信量を通知するボディ
fn upload_body(
    context: Vec<u8>,
    progress: Option<UnboundedSender<usize>>,
) -> impl Stream<Item = Bytes> + Send + 'static {
    let context = Bytes::from(context);
    let total = context.len();

    let chunks = (0..total)
        .step_by(UPLOAD_CHUNK_SIZE)
        .map(move |start| context.slice(start..(start + UPLOAD_CHUNK_SIZE).min(total)));

    // チャンクが送信側に引き取られた時点で通知する
    stream::iter(chunks).map(move |chunk| {
        if let Some(progress) = &progress {
            let _ = progress.send(chunk.len());
        }
        chunk
    })
}

/// デーモンの応答1件をイベントに変換
///
/// bollard はストリーム本文の `error` を `DockerStreamError` として返すので、
/// それはエラーイベントとして扱う。
fn into_event<T: Into<StatusEvent>>(
    item: Result<T, bollard::errors::Error>,
) -> Result<StatusEvent, bollard::errors::Error> {
    match item {
        Ok(info) => Ok(info.into()),
        Err(bollard::errors::Error::DockerStreamError { error }) => {
            Ok(StatusEvent::Error { message: error })
        }
        Err(e) => Err(e),
    }
}

/// 最初の応答を待ってからストリームを返す
///
/// 最初の要素が転送エラーならリクエスト自体が拒否されたものとして扱う。
async fn start_stream<'a, S, T>(
    operation: &'static str,
    target: String,
    stream: S,
) -> BuildResult<StatusStream<'a>>
where
    S: Stream<Item = Result<T, bollard::errors::Error>> + Send + 'a,
    T: Into<StatusEvent> + Send + 'a,
{
    let mut stream = Box::pin(stream);

    let first: Option<BuildResult<StatusEvent>> = match stream.next().await.map(into_event) {
        Some(Ok(event)) => Some(Ok(event)),
        Some(Err(source)) => {
            return Err(BuildError::Submission {
                operation,
                target,
                source,
            });
        }
        None => None,
    };

    let rest = stream.map(|item| into_event(item).map_err(BuildError::DockerConnection));
    Ok(stream::iter(first).chain(rest).boxed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{OutputSink, relay};
    use bollard::models::ErrorDetail;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_build_info_error_detail_wins() {
        let info = BuildInfo {
            error: Some("short".to_string()),
            error_detail: Some(ErrorDetail {
                message: Some("detailed".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(StatusEvent::from(info), StatusEvent::error("detailed"));
    }

    #[test]
    fn test_build_info_stream() {
        let info = BuildInfo {
            stream: Some("Step 1/2 : FROM alpine\n".to_string()),
            ..Default::default()
        };
        assert_eq!(
            StatusEvent::from(info),
            StatusEvent::stream("Step 1/2 : FROM alpine\n")
        );
    }

    #[test]
    fn test_push_info() {
        let info = PushImageInfo {
            status: Some("Pushing".to_string()),
            progress: Some("[==>   ]".to_string()),
            ..Default::default()
        };
        assert_eq!(
            StatusEvent::from(info),
            StatusEvent::status(None, "Pushing", Some("[==>   ]"))
        );

        let info = PushImageInfo {
            error: Some("denied".to_string()),
            ..Default::default()
        };
        assert_eq!(StatusEvent::from(info), StatusEvent::error("denied"));
    }

    #[tokio::test]
    async fn test_start_stream_rejects_on_first_error() {
        let source = stream::iter(vec![Err::<BuildInfo, _>(
            bollard::errors::Error::DockerResponseServerError {
                status_code: 400,
                message: "bad dockerfile".to_string(),
            },
        )]);

        let result = start_stream("docker build", "app:latest".to_string(), source).await;
        let err = result.err().unwrap();
        assert!(matches!(err, BuildError::Submission { .. }));
        assert!(err.to_string().starts_with("docker build app:latest"));
    }

    #[tokio::test]
    async fn test_start_stream_keeps_order() {
        let source = stream::iter(vec![
            Ok(BuildInfo {
                stream: Some("one".to_string()),
                ..Default::default()
            }),
            Ok(BuildInfo {
                stream: Some("two".to_string()),
                ..Default::default()
            }),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 500,
                message: "connection reset".to_string(),
            }),
        ]);

        let stream = start_stream("docker build", "app".to_string(), source)
            .await
            .unwrap();
        let items: Vec<_> = stream.collect().await;

        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_ref().unwrap(), &StatusEvent::stream("one"));
        assert_eq!(items[1].as_ref().unwrap(), &StatusEvent::stream("two"));
        assert!(matches!(items[2], Err(BuildError::DockerConnection(_))));
    }

    #[tokio::test]
    async fn test_stream_error_becomes_error_event() {
        let source = stream::iter(vec![
            Ok(BuildInfo {
                stream: Some("Step 1/2 : FROM alpine\n".to_string()),
                ..Default::default()
            }),
            Err(bollard::errors::Error::DockerStreamError {
                error: "COPY failed: no such file".to_string(),
            }),
        ]);

        let stream = start_stream("docker build", "app".to_string(), source)
            .await
            .unwrap();
        let err = relay(
            "docker build",
            stream,
            &mut OutputSink::discard(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, BuildError::StreamFailed { .. }));
        assert_eq!(err.to_string(), "docker build: COPY failed: no such file");
    }

    #[tokio::test]
    async fn test_first_stream_error_is_not_a_rejection() {
        let source = stream::iter(vec![Err::<PushImageInfo, _>(
            bollard::errors::Error::DockerStreamError {
                error: "pull access denied".to_string(),
            },
        )]);

        let stream = start_stream("pushing image to repository", "app:latest".to_string(), source)
            .await
            .unwrap();
        let err = relay(
            "pushing image to repository",
            stream,
            &mut OutputSink::discard(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert_eq!(
            err.to_string(),
            "pushing image to repository: pull access denied"
        );
    }

    #[tokio::test]
    async fn test_upload_body_reports_every_chunk() {
        let context = vec![7u8; UPLOAD_CHUNK_SIZE * 2 + 10];
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let chunks: Vec<Bytes> = upload_body(context.clone(), Some(tx)).collect().await;

        assert_eq!(
            chunks.iter().map(Bytes::len).collect::<Vec<_>>(),
            vec![UPLOAD_CHUNK_SIZE, UPLOAD_CHUNK_SIZE, 10]
        );
        assert_eq!(chunks.concat(), context);

        let mut reported = 0;
        while let Ok(n) = rx.try_recv() {
            reported += n;
        }
        assert_eq!(reported, context.len());
    }

    #[tokio::test]
    #[ignore] // Docker接続が必要なため、通常のテストではスキップ
    async fn test_list_images_against_daemon() {
        let daemon = DockerDaemon::connect().await.unwrap();
        let images = daemon.list_images("hoist-test-nothing:latest").await.unwrap();
        assert!(images.is_empty());
    }

    #[tokio::test]
    #[ignore] // Docker接続が必要なため、通常のテストではスキップ
    async fn test_build_against_daemon() {
        let temp_dir = tempfile::tempdir().unwrap();
        std::fs::write(temp_dir.path().join("Dockerfile"), "FROM scratch\nLABEL hoist=test\n")
            .unwrap();
        let context = crate::context::ContextBuilder::create_context(
            temp_dir.path(),
            std::path::Path::new("Dockerfile"),
            &[],
        )
        .unwrap();

        let daemon = DockerDaemon::connect().await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let context_len = context.len();
        let stream = daemon
            .build(BuildSubmission {
                tag: "hoist-test-build:latest".to_string(),
                dockerfile: "Dockerfile".to_string(),
                build_args: HashMap::new(),
                target: None,
                no_cache: true,
                auth_configs: HashMap::new(),
                context,
                upload_progress: Some(tx),
            })
            .await
            .unwrap();

        relay(
            "docker build",
            stream,
            &mut OutputSink::discard(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let mut sent = 0;
        while let Ok(n) = rx.try_recv() {
            sent += n;
        }
        assert_eq!(sent, context_len);
    }
}
