use futures_util::StreamExt;
use futures_util::stream;
use hoist_build::{
    BuildError, BuildResult, BuildSubmission, CredentialStore, DockerCredentials, ImageDaemon,
    ImageEntry, ImageReference, OutputSink, StatusEvent, StatusStream,
};
use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// 書き込まれた内容を後から読める出力先
#[derive(Clone, Default)]
pub struct Captured(Arc<Mutex<Vec<u8>>>);

#[allow(dead_code)]
impl Captured {
    pub fn sink(&self) -> OutputSink {
        OutputSink::plain(self.clone())
    }

    pub fn text(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// ストリームが破棄されたことを記録する
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FakeState {
    builds: Vec<BuildSubmission>,
    pushes: Vec<(ImageReference, Option<DockerCredentials>)>,
    list_filters: Vec<String>,
    images: Vec<ImageEntry>,
    events: Vec<StatusEvent>,
    hang: bool,
    reject: bool,
    fail_list: bool,
}

/// 呼び出しを記録し、決められたイベントを返すデーモン
#[derive(Clone, Default)]
pub struct FakeDaemon {
    state: Arc<Mutex<FakeState>>,
    stream_dropped: Arc<AtomicBool>,
}

#[allow(dead_code)]
impl FakeDaemon {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(self, events: Vec<StatusEvent>) -> Self {
        self.state.lock().unwrap().events = events;
        self
    }

    /// イベントを出し切った後、ストリームを閉じずに待ち続ける
    pub fn hanging(self) -> Self {
        self.state.lock().unwrap().hang = true;
        self
    }

    pub fn rejecting(self) -> Self {
        self.state.lock().unwrap().reject = true;
        self
    }

    pub fn failing_list(self) -> Self {
        self.state.lock().unwrap().fail_list = true;
        self
    }

    pub fn with_image(self, id: &str, repo_tags: &[&str]) -> Self {
        self.state.lock().unwrap().images.push(ImageEntry {
            id: id.to_string(),
            repo_tags: repo_tags.iter().map(|t| t.to_string()).collect(),
        });
        self
    }

    pub fn builds(&self) -> Vec<BuildSubmission> {
        self.state.lock().unwrap().builds.clone()
    }

    pub fn pushes(&self) -> Vec<(ImageReference, Option<DockerCredentials>)> {
        self.state.lock().unwrap().pushes.clone()
    }

    pub fn list_filters(&self) -> Vec<String> {
        self.state.lock().unwrap().list_filters.clone()
    }

    pub fn stream_dropped(&self) -> bool {
        self.stream_dropped.load(Ordering::SeqCst)
    }

    fn open_stream(
        &self,
        operation: &'static str,
        target: String,
    ) -> BuildResult<StatusStream<'static>> {
        let state = self.state.lock().unwrap();
        if state.reject {
            return Err(BuildError::Submission {
                operation,
                target,
                source: bollard::errors::Error::DockerResponseServerError {
                    status_code: 400,
                    message: "rejected".to_string(),
                },
            });
        }

        let flag = DropFlag(self.stream_dropped.clone());
        let events = stream::iter(state.events.clone().into_iter().map(Ok));
        let stream = if state.hang {
            events.chain(stream::pending()).boxed()
        } else {
            events.boxed()
        };

        Ok(stream
            .map(move |event| {
                let _keep = &flag;
                event
            })
            .boxed())
    }
}

impl ImageDaemon for FakeDaemon {
    async fn build(&self, mut submission: BuildSubmission) -> BuildResult<StatusStream<'_>> {
        // コンテキスト全体を受け取ったものとして送信量を通知
        if let Some(progress) = submission.upload_progress.take() {
            progress.send(submission.context.len()).unwrap();
        }

        let target = submission.tag.clone();
        self.state.lock().unwrap().builds.push(submission);
        self.open_stream("docker build", target)
    }

    async fn push(
        &self,
        reference: &ImageReference,
        credentials: Option<DockerCredentials>,
    ) -> BuildResult<StatusStream<'_>> {
        self.state
            .lock()
            .unwrap()
            .pushes
            .push((reference.clone(), credentials));
        self.open_stream("pushing image to repository", reference.with_default_tag())
    }

    async fn list_images(&self, reference_filter: &str) -> BuildResult<Vec<ImageEntry>> {
        let mut state = self.state.lock().unwrap();
        state.list_filters.push(reference_filter.to_string());
        if state.fail_list {
            return Err(BuildError::ImageList(
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 500,
                    message: "daemon unavailable".to_string(),
                },
            ));
        }

        // デーモン側の reference フィルタを再現
        Ok(state
            .images
            .iter()
            .filter(|image| image.repo_tags.iter().any(|t| t == reference_filter))
            .cloned()
            .collect())
    }
}

/// メモリ上の認証情報ストア
#[derive(Clone, Default)]
pub struct FakeCredentials {
    configs: HashMap<String, DockerCredentials>,
    broken: bool,
}

#[allow(dead_code)]
impl FakeCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_login(mut self, registry: &str, username: &str, password: &str) -> Self {
        self.configs.insert(
            registry.to_string(),
            DockerCredentials {
                username: Some(username.to_string()),
                password: Some(password.to_string()),
                serveraddress: Some(registry.to_string()),
                ..Default::default()
            },
        );
        self
    }

    pub fn broken() -> Self {
        Self {
            broken: true,
            ..Default::default()
        }
    }
}

impl CredentialStore for FakeCredentials {
    fn all_auth_configs(&self) -> anyhow::Result<HashMap<String, DockerCredentials>> {
        if self.broken {
            anyhow::bail!("credential store unreachable");
        }
        Ok(self.configs.clone())
    }

    fn auth_config_for_reference(
        &self,
        reference: &ImageReference,
    ) -> anyhow::Result<Option<DockerCredentials>> {
        if self.broken {
            anyhow::bail!("credential store unreachable");
        }
        Ok(self.configs.get(reference.registry()).cloned())
    }
}
