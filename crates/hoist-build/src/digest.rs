//! ビルド済みイメージの ID 解決

use crate::daemon::ImageDaemon;
use crate::error::BuildResult;
use crate::reference::ImageReference;

/// タグからイメージの ID（`sha256:...`）を取得
///
/// タグ省略時は `:latest` を補って完全一致で探す。
/// 一致するイメージが無い場合はエラーではなく空文字列を返す。
pub async fn resolve_digest<D: ImageDaemon>(daemon: &D, reference: &str) -> BuildResult<String> {
    let tagged = ImageReference::parse(reference).with_default_tag();

    let images = daemon.list_images(&tagged).await?;
    let id = images
        .into_iter()
        .find(|image| image.repo_tags.iter().any(|tag| *tag == tagged))
        .map(|image| image.id)
        .unwrap_or_default();

    if id.is_empty() {
        tracing::debug!("No image found for {}", tagged);
    }
    Ok(id)
}
