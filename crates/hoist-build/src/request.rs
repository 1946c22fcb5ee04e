use crate::error::{BuildError, BuildResult};
use crate::progress::OutputSink;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

/// 1回のイメージビルドの入力
pub struct BuildRequest {
    /// 付与するタグ（例: "ghcr.io/org/app:v1"）
    pub image_name: String,
    /// コンテキストからの相対パス
    pub dockerfile: PathBuf,
    pub context_dir: PathBuf,
    /// 値が `None` の引数は環境変数から補完する
    pub build_args: HashMap<String, Option<String>>,
    pub target: Option<String>,
    pub no_cache: bool,
    /// "Sending build context" の出力先
    pub progress_out: OutputSink,
    /// ビルドログの出力先
    pub build_out: OutputSink,
}

impl BuildRequest {
    pub fn new(
        image_name: impl Into<String>,
        context_dir: impl Into<PathBuf>,
        dockerfile: impl Into<PathBuf>,
    ) -> Self {
        Self {
            image_name: image_name.into(),
            dockerfile: dockerfile.into(),
            context_dir: context_dir.into(),
            build_args: HashMap::new(),
            target: None,
            no_cache: false,
            progress_out: OutputSink::stderr(),
            build_out: OutputSink::stdout(),
        }
    }

    pub fn with_build_arg(mut self, key: impl Into<String>, value: Option<String>) -> Self {
        self.build_args.insert(key.into(), value);
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_no_cache(mut self, no_cache: bool) -> Self {
        self.no_cache = no_cache;
        self
    }

    pub fn with_progress_output(mut self, sink: OutputSink) -> Self {
        self.progress_out = sink;
        self
    }

    pub fn with_build_output(mut self, sink: OutputSink) -> Self {
        self.build_out = sink;
        self
    }

    /// ビルドコンテキストのパスを検証
    pub fn resolve_context(&self) -> BuildResult<PathBuf> {
        let context = &self.context_dir;

        if !context.exists() {
            return Err(BuildError::ContextNotFound(context.clone()));
        }

        if !context.is_dir() {
            return Err(BuildError::InvalidConfig(format!(
                "Build context is not a directory: {}",
                context.display()
            )));
        }

        Ok(context.clone())
    }

    /// Dockerfileのコンテキスト相対パスを解決
    ///
    /// コンテキスト外を指す場合はエラー
    pub fn resolve_dockerfile(&self) -> BuildResult<PathBuf> {
        let dockerfile = relative_to_context(&self.context_dir, &self.dockerfile)?;
        if dockerfile.as_os_str().is_empty() {
            return Err(BuildError::InvalidConfig(format!(
                "Dockerfile path points at the build context itself: {}",
                self.dockerfile.display()
            )));
        }
        Ok(dockerfile)
    }

    /// ビルド引数の解決
    ///
    /// 値が `None` の引数は同名の環境変数で補完し、
    /// 環境変数も無ければ Dockerfile の ARG デフォルトに任せる（送信しない）
    pub fn resolve_build_args(&self) -> HashMap<String, String> {
        let mut resolved_args = HashMap::new();

        for (key, value) in &self.build_args {
            let value = match value {
                Some(v) => Some(v.clone()),
                None => std::env::var(key).ok(),
            };
            if let Some(value) = value {
                validate_build_arg(key);
                resolved_args.insert(key.clone(), value);
            } else {
                tracing::debug!("Build arg {} is unset, using Dockerfile default", key);
            }
        }

        resolved_args
    }
}

/// ビルド引数の検証（機密情報の警告）
fn validate_build_arg(key: &str) {
    let sensitive_patterns = ["password", "token", "secret", "api_key", "private_key"];

    let key_lower = key.to_lowercase();
    if sensitive_patterns.iter().any(|p| key_lower.contains(p)) {
        tracing::warn!(
            "警告: ビルド引数 '{}' は機密情報を含む可能性があります。\n\
             ビルド引数はイメージ履歴に記録されます。\n\
             機密情報はビルド引数ではなく、シークレットマウントを使用してください。",
            key
        );
    }
}

/// パスをコンテキストからの相対パスへ正規化
///
/// 絶対パスはコンテキストのプレフィックスを取り除き、`..` は字句的に解決する。
/// コンテキスト自体を指す場合は空のパスを返す。
pub(crate) fn relative_to_context(context: &Path, path: &Path) -> BuildResult<PathBuf> {
    let outside = || BuildError::PathOutsideContext {
        path: path.to_path_buf(),
        context: context.to_path_buf(),
    };

    let relative = if path.is_absolute() {
        let context = normalize(context).ok_or_else(outside)?;
        let path = normalize(path).ok_or_else(outside)?;
        path.strip_prefix(&context).map_err(|_| outside())?.to_path_buf()
    } else {
        normalize(path).ok_or_else(outside)?
    };

    Ok(relative)
}

/// `.` と `..` を字句的に解決する（ルートより上に出る場合は None）
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !matches!(
                    normalized.components().next_back(),
                    Some(Component::Normal(_))
                ) {
                    return None;
                }
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    Some(normalized)
}
