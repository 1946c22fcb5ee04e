//! イメージプッシュ処理
//!
//! ビルドしたイメージをコンテナレジストリにプッシュします。

use crate::auth::CredentialStore;
use crate::daemon::ImageDaemon;
use crate::error::{BuildError, BuildResult};
use crate::progress::{OutputSink, relay};
use crate::reference::ImageReference;
use tokio_util::sync::CancellationToken;

const OPERATION: &str = "pushing image to repository";

/// イメージプッシュを実行するハンドラ
pub struct ImagePusher<D, C> {
    daemon: D,
    auth: C,
}

impl<D, C> ImagePusher<D, C>
where
    D: ImageDaemon,
    C: CredentialStore,
{
    /// 認証情報ストアを指定して作成
    pub fn new(daemon: D, auth: C) -> Self {
        Self { daemon, auth }
    }

    pub fn daemon(&self) -> &D {
        &self.daemon
    }

    /// イメージをレジストリにプッシュ
    ///
    /// # Arguments
    /// * `image` - イメージ名（レジストリ込み、例: "ghcr.io/org/app:v1.0"）
    /// * `out` - プッシュ進捗の出力先
    ///
    /// # Returns
    /// プッシュ成功時はタグ込みの完全なイメージ名を返す
    pub async fn push(
        &self,
        cancel: &CancellationToken,
        image: &str,
        out: &mut OutputSink,
    ) -> BuildResult<String> {
        let reference = ImageReference::parse(image);

        // タグのバリデーション
        if let Some(tag) = reference.tag() {
            validate_tag(tag)?;
        }

        // 対象レジストリの認証情報だけを取得
        let credentials = self
            .auth
            .auth_config_for_reference(&reference)
            .map_err(|source| BuildError::PushAuth {
                reference: image.to_string(),
                source,
            })?;
        tracing::debug!(
            "Pushing {} to {} ({})",
            reference,
            reference.registry(),
            if credentials.is_some() {
                "authenticated"
            } else {
                "anonymous"
            }
        );

        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(BuildError::Cancelled { operation: OPERATION });
            }
            stream = self.daemon.push(&reference, credentials) => stream?,
        };

        relay(OPERATION, stream, out, cancel).await?;

        let full_image = reference.with_default_tag();
        tracing::info!("Successfully pushed: {}", full_image);
        Ok(full_image)
    }
}

/// タグのバリデーション
///
/// Docker タグの制約:
/// - 128文字以下
/// - 英数字、ピリオド、ハイフン、アンダースコアのみ
/// - 先頭はピリオドまたはハイフンではない
pub fn validate_tag(tag: &str) -> BuildResult<()> {
    if tag.is_empty() {
        return Err(BuildError::InvalidTag {
            tag: "(empty)".to_string(),
        });
    }

    if tag.len() > 128 {
        return Err(BuildError::InvalidTag {
            tag: format!("Tag too long ({} characters, max 128)", tag.len()),
        });
    }

    if tag.starts_with('.') || tag.starts_with('-') {
        return Err(BuildError::InvalidTag {
            tag: tag.to_string(),
        });
    }

    if let Some(c) = tag
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && *c != '.' && *c != '-' && *c != '_')
    {
        return Err(BuildError::InvalidTag {
            tag: format!("Invalid character '{}' in tag: {}", c, tag),
        });
    }

    Ok(())
}
