use crate::error::{BuildError, BuildResult};
use crate::request::relative_to_context;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::collections::{BTreeSet, HashSet};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tar::{Builder, EntryType, Header, HeaderMode};

pub struct ContextBuilder;

impl ContextBuilder {
    /// Dockerfile と依存パスだけを含むビルドコンテキストを tar.gz として作成
    ///
    /// `dockerfile` はコンテキスト相対パス、`dependencies` は相対・絶対どちらでもよい。
    /// 全エントリの所有者は uid/gid 0 に揃える。
    pub fn create_context(
        context_path: &Path,
        dockerfile: &Path,
        dependencies: &[PathBuf],
    ) -> BuildResult<Vec<u8>> {
        tracing::debug!("Creating build context from: {}", context_path.display());

        if !context_path.is_dir() {
            return Err(BuildError::ContextNotFound(context_path.to_path_buf()));
        }

        let dockerfile = relative_to_context(context_path, dockerfile)?;
        if !context_path.join(&dockerfile).is_file() {
            return Err(BuildError::DockerfileOpen {
                path: context_path.join(&dockerfile),
                source: io::Error::new(io::ErrorKind::NotFound, "no such file"),
            });
        }

        // コンテキスト外のパスはここで弾く
        let mut members = BTreeSet::new();
        members.insert(dockerfile);
        for dependency in dependencies {
            members.insert(relative_to_context(context_path, dependency)?);
        }

        let root = fs::canonicalize(context_path).map_err(BuildError::Archive)?;
        for member in &members {
            Self::ensure_inside(&root, context_path, member)?;
        }

        let archive_data = Self::write_archive(context_path, &members).map_err(BuildError::Archive)?;

        tracing::debug!(
            "Build context created: {} bytes ({} paths)",
            archive_data.len(),
            members.len()
        );

        // コンテキストサイズの警告
        Self::check_context_size(archive_data.len());

        Ok(archive_data)
    }

    /// 途中のディレクトリがシンボリックリンクでコンテキスト外を指していないか確認
    ///
    /// パス自体がシンボリックリンクの場合はリンクとして格納するので辿らない。
    fn ensure_inside(root: &Path, context_path: &Path, member: &Path) -> BuildResult<()> {
        let Some(parent) = member.parent().filter(|p| !p.as_os_str().is_empty()) else {
            return Ok(());
        };

        // 存在しない場合はアーカイブ作成時にエラーになる
        let Ok(resolved) = fs::canonicalize(context_path.join(parent)) else {
            return Ok(());
        };

        if !resolved.starts_with(root) {
            return Err(BuildError::PathOutsideContext {
                path: context_path.join(member),
                context: context_path.to_path_buf(),
            });
        }
        Ok(())
    }

    fn write_archive(context_path: &Path, members: &BTreeSet<PathBuf>) -> io::Result<Vec<u8>> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut tar = Builder::new(encoder);
        let mut seen = HashSet::new();

        for member in members {
            Self::append_path(&mut tar, context_path, member, &mut seen)?;
        }

        tar.into_inner()?.finish()
    }

    /// パスを追加（ディレクトリは再帰的に追加）
    fn append_path<W: Write>(
        tar: &mut Builder<W>,
        context_path: &Path,
        relative: &Path,
        seen: &mut HashSet<PathBuf>,
    ) -> io::Result<()> {
        if !seen.insert(relative.to_path_buf()) {
            return Ok(());
        }

        let full_path = context_path.join(relative);
        let metadata = fs::symlink_metadata(&full_path).map_err(|e| {
            io::Error::new(e.kind(), format!("{}: {}", relative.display(), e))
        })?;

        // 空のパスはコンテキスト全体（COPY . .）を意味する
        let is_root = relative.as_os_str().is_empty();

        let mut header = Header::new_gnu();
        if !is_root {
            header.set_metadata_in_mode(&metadata, HeaderMode::Deterministic);
            header.set_uid(0);
            header.set_gid(0);
        }

        let file_type = metadata.file_type();
        if file_type.is_symlink() {
            let target = fs::read_link(&full_path)?;
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            tar.append_link(&mut header, relative, target)?;
        } else if file_type.is_dir() {
            if !is_root {
                header.set_size(0);
                tar.append_data(&mut header, relative, io::empty())?;
            }

            let mut children = fs::read_dir(&full_path)?
                .map(|entry| entry.map(|e| e.file_name()))
                .collect::<io::Result<Vec<_>>>()?;
            children.sort();

            for child in children {
                Self::append_path(tar, context_path, &relative.join(child), seen)?;
            }
        } else {
            let file = File::open(&full_path)?;
            tar.append_data(&mut header, relative, file)?;
        }

        Ok(())
    }

    /// コンテキストサイズのチェックと警告
    fn check_context_size(size: usize) {
        const MAX_CONTEXT_SIZE: usize = 500 * 1024 * 1024; // 500MB

        if size > MAX_CONTEXT_SIZE {
            tracing::warn!(
                "警告: ビルドコンテキストが大きすぎます（{}MB）\n\
                 COPY / ADD のソースを絞り込むことを推奨します。",
                size / 1024 / 1024
            );
        }
    }
}
