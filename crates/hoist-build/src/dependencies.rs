//! Dockerfile の依存パス解決
//!
//! ビルドコンテキストに含めるファイルを COPY / ADD 命令から決定します。

use anyhow::Context;
use std::path::{Path, PathBuf};

/// Dockerfile からビルドに必要なパスを返すパーサー
pub trait DependencyResolver {
    /// `context_dir` を基準に、Dockerfile が参照するパスの一覧を返す
    ///
    /// 返すパスはコンテキスト相対でも絶対パスでもよい
    fn resolve(&self, context_dir: &Path, dockerfile: &str) -> anyhow::Result<Vec<PathBuf>>;
}

/// COPY / ADD 命令のソースを読み取るデフォルト実装
#[derive(Debug, Default, Clone, Copy)]
pub struct DockerfileDependencies;

impl DependencyResolver for DockerfileDependencies {
    fn resolve(&self, context_dir: &Path, dockerfile: &str) -> anyhow::Result<Vec<PathBuf>> {
        let mut paths = Vec::new();

        for instruction in logical_lines(dockerfile) {
            let Some((keyword, rest)) = instruction.split_once(char::is_whitespace) else {
                continue;
            };
            if !keyword.eq_ignore_ascii_case("COPY") && !keyword.eq_ignore_ascii_case("ADD") {
                continue;
            }

            for source in copy_sources(rest)
                .with_context(|| format!("parsing instruction: {}", instruction))?
            {
                if is_remote(&source) {
                    continue;
                }
                paths.extend(expand_source(context_dir, &source)?);
            }
        }

        tracing::debug!("Resolved {} dockerfile dependencies", paths.len());
        Ok(paths)
    }
}

/// 継続行を連結し、コメントと空行を除いた命令行を返す
fn logical_lines(dockerfile: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();

    for line in dockerfile.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        if let Some(continued) = trimmed.strip_suffix('\\') {
            current.push_str(continued);
            current.push(' ');
        } else {
            current.push_str(trimmed);
            lines.push(std::mem::take(&mut current));
        }
    }

    if !current.trim().is_empty() {
        lines.push(current);
    }

    lines
}

/// COPY / ADD の引数からソースパスを取り出す
///
/// `--from` 付きの命令は別ステージからのコピーなので対象外
fn copy_sources(args: &str) -> anyhow::Result<Vec<String>> {
    let mut rest = args.trim();
    loop {
        let Some(flag) = rest.strip_prefix("--") else {
            break;
        };
        let (flag, remaining) = flag.split_once(char::is_whitespace).unwrap_or((flag, ""));
        if flag.starts_with("from=") {
            return Ok(Vec::new());
        }
        rest = remaining.trim_start();
    }

    let mut operands: Vec<String> = if rest.starts_with('[') {
        serde_json::from_str(rest).context("invalid JSON array form")?
    } else {
        rest.split_whitespace().map(str::to_string).collect()
    };

    // 最後の引数はコピー先
    if operands.len() < 2 {
        anyhow::bail!("expected at least one source and a destination");
    }
    operands.pop();
    Ok(operands)
}

fn is_remote(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://") || source.starts_with("git@")
}

/// ワイルドカードを含むソースをコンテキスト内で展開
fn expand_source(context_dir: &Path, source: &str) -> anyhow::Result<Vec<PathBuf>> {
    if !source.contains(['*', '?', '[']) {
        return Ok(vec![PathBuf::from(source)]);
    }

    // コンテキストディレクトリ側の `[` などはパターンとして解釈させない
    let base = glob::Pattern::escape(&context_dir.to_string_lossy());
    let pattern = Path::new(&base).join(source);
    let pattern = pattern.to_string_lossy();
    let mut matches = Vec::new();
    for entry in glob::glob(&pattern).with_context(|| format!("invalid pattern: {}", source))? {
        matches.push(entry.with_context(|| format!("reading matches for {}", source))?);
    }

    if matches.is_empty() {
        anyhow::bail!("no source files were specified for pattern {}", source);
    }
    Ok(matches)
}
