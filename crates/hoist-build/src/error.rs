use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Build context directory not found: {0}")]
    ContextNotFound(PathBuf),

    #[error("opening dockerfile {path}: {source}")]
    DockerfileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is outside the build context {context}")]
    PathOutsideContext { path: PathBuf, context: PathBuf },

    #[error("resolving dockerfile dependencies: {0}")]
    Dependencies(#[source] anyhow::Error),

    #[error("tar workspace: {0}")]
    Archive(#[source] std::io::Error),

    #[error("read auth configs: {0}")]
    ReadAuthConfigs(#[source] anyhow::Error),

    #[error("getting auth config for {reference}: {source}")]
    PushAuth {
        reference: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Registry authentication failed for {registry}: {message}")]
    AuthFailed { registry: String, message: String },

    #[error("{operation} {target}: {source}")]
    Submission {
        operation: &'static str,
        target: String,
        #[source]
        source: bollard::errors::Error,
    },

    #[error("{operation}: {message}")]
    StreamFailed {
        operation: &'static str,
        message: String,
    },

    #[error("{operation} cancelled")]
    Cancelled { operation: &'static str },

    #[error("getting image id: {0}")]
    ImageList(#[source] bollard::errors::Error),

    #[error("Invalid image tag: {tag}")]
    InvalidTag { tag: String },

    #[error("Docker connection error: {0}")]
    DockerConnection(#[from] bollard::errors::Error),

    #[error("Invalid build configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BuildError {
    /// 呼び出し側がキャンセルした結果のエラーかどうか
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BuildError::Cancelled { .. })
    }

    /// ユーザー向けの分かりやすいエラーメッセージ
    pub fn user_message(&self) -> String {
        match self {
            BuildError::DockerfileOpen { path, .. } => {
                format!(
                    "Dockerfileを開けません: {}\n\
                     \n\
                     解決方法:\n\
                     1. Dockerfileのパスを確認してください\n\
                     2. パスはビルドコンテキストからの相対パスで指定してください",
                    path.display()
                )
            }
            BuildError::ContextNotFound(path) => {
                format!(
                    "ビルドコンテキストが見つかりません: {}\n\
                     \n\
                     contextパスを確認してください。",
                    path.display()
                )
            }
            BuildError::PathOutsideContext { path, context } => {
                format!(
                    "ビルドコンテキストの外部を参照しています: {}\n\
                     \n\
                     COPY/ADD のソースは {} 配下に置いてください。",
                    path.display(),
                    context.display()
                )
            }
            BuildError::StreamFailed { message, .. } => {
                format!(
                    "ビルドに失敗しました: {}\n\
                     \n\
                     Dockerfileの内容を確認してください。",
                    message
                )
            }
            BuildError::ReadAuthConfigs(_) | BuildError::PushAuth { .. } => {
                format!(
                    "{}\n\
                     \n\
                     解決方法:\n\
                     1. docker login でレジストリにログインしてください\n\
                     2. ~/.docker/config.json の credsStore / credHelpers を確認してください",
                    self
                )
            }
            BuildError::DockerConnection(_) | BuildError::Submission { .. } => {
                format!(
                    "{}\n\
                     \n\
                     ヒント:\n\
                     • Dockerが起動しているか確認してください\n\
                     • DOCKER_HOST の設定を確認してください",
                    self
                )
            }
            _ => format!("{}", self),
        }
    }
}

pub type BuildResult<T> = std::result::Result<T, BuildError>;
