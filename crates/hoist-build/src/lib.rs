//! Hoist: Docker image build & push orchestration
//!
//! Dockerfile が参照するファイルだけでビルドコンテキストを作り、
//! レジストリ認証を付けてデーモンにビルド・プッシュを依頼し、
//! デーモンのステータスを出力先へ中継します。

pub mod auth;
pub mod builder;
pub mod context;
pub mod daemon;
pub mod dependencies;
pub mod digest;
pub mod error;
pub mod progress;
pub mod pusher;
pub mod reference;
pub mod request;

pub use auth::{CredentialStore, RegistryAuth};
pub use builder::ImageBuilder;
pub use context::ContextBuilder;
pub use daemon::{
    BuildSubmission, DockerDaemon, ImageDaemon, ImageEntry, ProgressUpdate, StatusEvent,
    StatusStream,
};
pub use dependencies::{DependencyResolver, DockerfileDependencies};
pub use digest::resolve_digest;
pub use error::{BuildError, BuildResult};
pub use progress::{OutputSink, relay};
pub use pusher::{ImagePusher, validate_tag};
pub use reference::{ImageReference, split_image_tag};
pub use request::BuildRequest;

pub use bollard::auth::DockerCredentials;
pub use tokio_util::sync::CancellationToken;
