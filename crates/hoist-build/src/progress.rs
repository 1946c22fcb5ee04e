//! ステータスイベントの表示
//!
//! デーモンから届いたイベントを到着順に出力先へ書き出します。
//! 端末ではレイヤーごとのプログレスバーを indicatif で描画します。

use crate::daemon::{ProgressUpdate, StatusEvent, StatusStream};
use crate::error::{BuildError, BuildResult};
use colored::Colorize;
use futures_util::StreamExt;
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle, TermLike};
use std::collections::HashMap;
use std::fmt;
use std::io::{self, IsTerminal, Write};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

const UPLOAD_MESSAGE: &str = "Sending build context to Docker daemon";

/// 任意の書き込み先を端末として描画するときの幅
const TERM_WIDTH: u16 = 80;

type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

#[derive(Debug, Clone, Copy)]
enum Terminal {
    Stdout,
    Stderr,
    Writer,
}

/// 出力先
///
/// 端末でない出力先には制御シーケンスを書かない。
pub struct OutputSink {
    writer: SharedWriter,
    terminal: Option<Terminal>,
}

impl OutputSink {
    pub fn new(writer: impl Write + Send + 'static, terminal: bool) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
            terminal: terminal.then_some(Terminal::Writer),
        }
    }

    /// 1イベント1行のプレーン出力
    pub fn plain(writer: impl Write + Send + 'static) -> Self {
        Self::new(writer, false)
    }

    pub fn stdout() -> Self {
        let mut sink = Self::plain(io::stdout());
        if io::stdout().is_terminal() {
            sink.terminal = Some(Terminal::Stdout);
        }
        sink
    }

    pub fn stderr() -> Self {
        let mut sink = Self::plain(io::stderr());
        if io::stderr().is_terminal() {
            sink.terminal = Some(Terminal::Stderr);
        }
        sink
    }

    pub fn discard() -> Self {
        Self::plain(io::sink())
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal.is_some()
    }

    /// indicatif の描画先
    pub(crate) fn draw_target(&self) -> ProgressDrawTarget {
        match self.terminal {
            Some(Terminal::Stdout) => ProgressDrawTarget::stdout(),
            Some(Terminal::Stderr) => ProgressDrawTarget::stderr(),
            Some(Terminal::Writer) => {
                ProgressDrawTarget::term_like(Box::new(SinkTerm(self.writer.clone())))
            }
            None => ProgressDrawTarget::hidden(),
        }
    }
}

fn lock(writer: &SharedWriter) -> io::Result<std::sync::MutexGuard<'_, Box<dyn Write + Send>>> {
    writer
        .lock()
        .map_err(|_| io::Error::other("output sink lock poisoned"))
}

impl Write for OutputSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock(&self.writer)?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        lock(&self.writer)?.flush()
    }
}

/// 任意の書き込み先を indicatif の端末として扱う
struct SinkTerm(SharedWriter);

impl SinkTerm {
    fn write_raw(&self, s: &str) -> io::Result<()> {
        lock(&self.0)?.write_all(s.as_bytes())
    }

    fn move_cursor(&self, n: usize, code: char) -> io::Result<()> {
        if n == 0 {
            return Ok(());
        }
        self.write_raw(&format!("\x1b[{}{}", n, code))
    }
}

impl fmt::Debug for SinkTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkTerm").finish_non_exhaustive()
    }
}

impl TermLike for SinkTerm {
    fn width(&self) -> u16 {
        TERM_WIDTH
    }

    fn move_cursor_up(&self, n: usize) -> io::Result<()> {
        self.move_cursor(n, 'A')
    }

    fn move_cursor_down(&self, n: usize) -> io::Result<()> {
        self.move_cursor(n, 'B')
    }

    fn move_cursor_right(&self, n: usize) -> io::Result<()> {
        self.move_cursor(n, 'C')
    }

    fn move_cursor_left(&self, n: usize) -> io::Result<()> {
        self.move_cursor(n, 'D')
    }

    fn write_line(&self, s: &str) -> io::Result<()> {
        self.write_raw(s)?;
        self.write_raw("\n")
    }

    fn write_str(&self, s: &str) -> io::Result<()> {
        self.write_raw(s)
    }

    fn clear_line(&self) -> io::Result<()> {
        self.write_raw("\r\x1b[2K")
    }

    fn flush(&self) -> io::Result<()> {
        lock(&self.0)?.flush()
    }
}

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template).unwrap_or_else(|_| ProgressStyle::default_bar())
}

/// 進捗行を組み立てる（`id: status progress`）
fn status_line(update: &ProgressUpdate, status: &str) -> String {
    let mut line = String::new();
    if let Some(id) = &update.id {
        line.push_str(id);
        line.push_str(": ");
    }
    line.push_str(status);
    if let Some(progress) = update.progress.as_deref().filter(|p| !p.is_empty()) {
        line.push(' ');
        line.push_str(progress);
    }
    line
}

/// 進捗の描画方法
enum StatusRenderer {
    Plain,
    Terminal(TerminalRenderer),
}

impl StatusRenderer {
    fn for_sink(sink: &OutputSink) -> Self {
        if sink.is_terminal() {
            StatusRenderer::Terminal(TerminalRenderer::new(sink.draw_target()))
        } else {
            StatusRenderer::Plain
        }
    }

    fn render(&mut self, sink: &mut OutputSink, update: &ProgressUpdate) -> io::Result<()> {
        match self {
            StatusRenderer::Plain => {
                if let Some(text) = &update.stream {
                    // ビルドステップの出力はそのまま
                    sink.write_all(text.as_bytes())?;
                } else if let Some(status) = &update.status {
                    writeln!(sink, "{}", status_line(update, status))?;
                }
                sink.flush()
            }
            StatusRenderer::Terminal(renderer) => renderer.render(update),
        }
    }

    fn close(&mut self, sink: &mut OutputSink) -> io::Result<()> {
        match self {
            StatusRenderer::Plain => sink.flush(),
            StatusRenderer::Terminal(renderer) => renderer.close(),
        }
    }
}

/// レイヤー id ごとにプログレスバーを持つ端末描画
struct TerminalRenderer {
    multi: MultiProgress,
    bars: HashMap<String, ProgressBar>,
    /// 改行前のビルド出力
    partial: String,
}

impl TerminalRenderer {
    fn new(target: ProgressDrawTarget) -> Self {
        Self {
            multi: MultiProgress::with_draw_target(target),
            bars: HashMap::new(),
            partial: String::new(),
        }
    }

    fn render(&mut self, update: &ProgressUpdate) -> io::Result<()> {
        if let Some(text) = &update.stream {
            self.partial.push_str(text);
            while let Some(pos) = self.partial.find('\n') {
                let line: String = self.partial.drain(..=pos).collect();
                self.multi.println(line.trim_end_matches(['\r', '\n']))?;
            }
            return Ok(());
        }

        let Some(status) = &update.status else {
            return Ok(());
        };
        let progress = update.progress.as_deref().filter(|p| !p.is_empty());

        match (&update.id, progress) {
            (Some(id), Some(progress)) => {
                self.bar(id).set_message(format!("{} {}", status, progress));
            }
            (Some(id), None) if self.bars.contains_key(id) => {
                self.bar(id).set_message(status.clone());
            }
            _ => {
                let line = status_line(update, status);
                self.multi.println(line.cyan().to_string())?;
            }
        }
        Ok(())
    }

    fn bar(&mut self, id: &str) -> &ProgressBar {
        let multi = &self.multi;
        self.bars.entry(id.to_string()).or_insert_with(|| {
            multi.add(
                ProgressBar::no_length()
                    .with_style(style("{prefix}: {wide_msg}"))
                    .with_prefix(id.to_string()),
            )
        })
    }

    fn close(&mut self) -> io::Result<()> {
        if !self.partial.is_empty() {
            let rest = std::mem::take(&mut self.partial);
            self.multi.println(rest)?;
        }
        // 最後の状態を残して描画を止める
        for bar in self.bars.values() {
            bar.finish();
        }
        Ok(())
    }
}

/// ビルドコンテキストの送信状況
///
/// 端末ではバイト数のバーを描画し、それ以外では送信完了時に1行だけ書く。
pub(crate) struct UploadReporter {
    bar: Option<ProgressBar>,
    total: u64,
    sent: u64,
}

impl UploadReporter {
    pub(crate) fn new(sink: &OutputSink, total: u64) -> Self {
        let bar = sink.is_terminal().then(|| {
            ProgressBar::with_draw_target(Some(total), sink.draw_target())
                .with_style(style("{msg}  {bytes}/{total_bytes}"))
                .with_message(UPLOAD_MESSAGE)
        });
        Self {
            bar,
            total,
            sent: 0,
        }
    }

    pub(crate) fn advance(&mut self, bytes: usize) {
        self.sent += bytes as u64;
        if let Some(bar) = &self.bar {
            bar.set_position(self.sent);
        }
    }

    pub(crate) fn finish(self, sink: &mut OutputSink) -> io::Result<()> {
        // デーモンが送信量を報告しない場合はアーカイブ全体を送ったものとみなす
        let sent = if self.sent == 0 { self.total } else { self.sent };
        tracing::debug!("Sent {} bytes of build context", sent);

        match self.bar {
            Some(bar) => {
                bar.set_position(sent);
                bar.finish();
                Ok(())
            }
            None => {
                writeln!(sink, "{}  {}", UPLOAD_MESSAGE, HumanBytes(sent))?;
                sink.flush()
            }
        }
    }
}

/// ステータスストリームを最後まで読み、出力先へ書き出す
///
/// エラーイベントを受け取った時点で読み込みを止め、そのメッセージを返す。
/// それまでに書いた出力はそのまま残る。
pub async fn relay(
    operation: &'static str,
    mut stream: StatusStream<'_>,
    sink: &mut OutputSink,
    cancel: &CancellationToken,
) -> BuildResult<()> {
    let mut renderer = StatusRenderer::for_sink(sink);

    let result = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::warn!("{} cancelled, closing the daemon stream", operation);
                break Err(BuildError::Cancelled { operation });
            }
            next = stream.next() => next,
        };

        match next {
            None => break Ok(()),
            Some(Ok(StatusEvent::Progress(update))) => {
                if let Err(e) = renderer.render(sink, &update) {
                    break Err(BuildError::Io(e));
                }
            }
            Some(Ok(StatusEvent::Error { message })) => {
                tracing::debug!("{} reported an error: {}", operation, message);
                break Err(BuildError::StreamFailed { operation, message });
            }
            Some(Err(e)) => break Err(e),
        }
    };

    // 接続を閉じる
    drop(stream);

    let closed = renderer.close(sink);
    match result {
        Ok(()) => closed.map_err(BuildError::Io),
        Err(e) => Err(e),
    }
}
