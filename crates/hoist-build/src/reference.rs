//! イメージ参照のパース
//!
//! `repository[:tag]` 形式の文字列からレジストリとタグを取り出します。

use std::fmt;

/// Docker Hub のレジストリ名
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// タグ省略時のデフォルトタグ
pub const DEFAULT_TAG: &str = "latest";

/// パース済みのイメージ参照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    repository: String,
    tag: Option<String>,
}

impl ImageReference {
    pub fn parse(reference: &str) -> Self {
        let (repository, tag) = split_image_tag(reference);
        Self {
            repository: repository.to_string(),
            tag: tag.map(str::to_string),
        }
    }

    /// タグを除いたリポジトリ名（レジストリ込み）
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// 明示的に指定されたタグ
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// タグ（省略時は "latest"）
    pub fn tag_or_latest(&self) -> &str {
        self.tag.as_deref().unwrap_or(DEFAULT_TAG)
    }

    /// タグを補完した `repository:tag` 形式
    pub fn with_default_tag(&self) -> String {
        format!("{}:{}", self.repository, self.tag_or_latest())
    }

    /// イメージ名からレジストリを抽出
    ///
    /// # Examples
    /// - `ghcr.io/org/app:tag` -> `ghcr.io`
    /// - `myuser/app:tag` -> `docker.io`
    /// - `123456.dkr.ecr.region.amazonaws.com/app` -> `123456.dkr.ecr.region.amazonaws.com`
    /// - `localhost:5000/app` -> `localhost:5000`
    pub fn registry(&self) -> &str {
        if let Some((first, _)) = self.repository.split_once('/') {
            // `.` か `:` を含むか、localhost ならレジストリ
            if first.contains('.') || first.contains(':') || first == "localhost" {
                return first;
            }
        }

        DEFAULT_REGISTRY
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tag {
            Some(tag) => write!(f, "{}:{}", self.repository, tag),
            None => f.write_str(&self.repository),
        }
    }
}

/// イメージ名とタグを分離
///
/// # Examples
/// - `ghcr.io/org/app:v1.0` -> `("ghcr.io/org/app", Some("v1.0"))`
/// - `ghcr.io/org/app` -> `("ghcr.io/org/app", None)`
/// - `localhost:5000/app:dev` -> `("localhost:5000/app", Some("dev"))`
pub fn split_image_tag(image: &str) -> (&str, Option<&str>) {
    // 最後の : を探す
    if let Some(pos) = image.rfind(':') {
        let potential_tag = &image[pos + 1..];
        let potential_image = &image[..pos];

        // タグか、レジストリのポート番号かを判定
        // localhost:5000/app の場合、: 以降に / が含まれる
        if !potential_tag.contains('/') && !potential_tag.is_empty() {
            return (potential_image, Some(potential_tag));
        }
    }

    (image, None)
}
