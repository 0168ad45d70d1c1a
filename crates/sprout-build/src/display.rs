//! ビルド出力の末尾数行を表示するローリング表示

use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::VecDeque;
use std::sync::Mutex;

/// 表示する行数
pub const DISPLAY_LINES: usize = 4;

const MAX_LINE_WIDTH: usize = 76;
const TRUNCATED_WIDTH: usize = 73;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStyle {
    Stdout,
    Stderr,
}

/// 直近 [`DISPLAY_LINES`] 行のリングバッファと、その描画先
///
/// 複数の読み取りタスクから共有され、1回の `push` は不可分に反映されます。
pub struct RollingDisplay {
    ring: Mutex<VecDeque<(String, LineStyle)>>,
    bars: Vec<ProgressBar>,
    _multi: MultiProgress,
}

impl RollingDisplay {
    /// 端末（stderr）に描画する
    pub fn new() -> Self {
        Self::with_target(ProgressDrawTarget::stderr())
    }

    /// 何も描画しない（テストや非対話環境向け）
    pub fn hidden() -> Self {
        Self::with_target(ProgressDrawTarget::hidden())
    }

    fn with_target(target: ProgressDrawTarget) -> Self {
        let multi = MultiProgress::with_draw_target(target);
        let style = ProgressStyle::with_template("  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        let bars = (0..DISPLAY_LINES)
            .map(|_| {
                let bar = multi.add(ProgressBar::new_spinner());
                bar.set_style(style.clone());
                bar
            })
            .collect();

        Self {
            ring: Mutex::new(VecDeque::with_capacity(DISPLAY_LINES)),
            bars,
            _multi: multi,
        }
    }

    /// 1行追加して再描画
    pub fn push(&self, line: &str, style: LineStyle) {
        let line = truncate_line(line);
        let mut ring = match self.ring.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if ring.len() == DISPLAY_LINES {
            ring.pop_front();
        }
        ring.push_back((line, style));

        for (i, bar) in self.bars.iter().enumerate() {
            match ring.get(i) {
                Some((text, LineStyle::Stdout)) => bar.set_message(text.cyan().to_string()),
                Some((text, LineStyle::Stderr)) => bar.set_message(text.yellow().to_string()),
                None => bar.set_message(String::new()),
            }
        }
    }

    /// 現在表示している行（古い順）
    pub fn snapshot(&self) -> Vec<String> {
        let ring = match self.ring.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        ring.iter().map(|(text, _)| text.clone()).collect()
    }

    /// 表示を消す
    pub fn finish(&self) {
        for bar in &self.bars {
            bar.finish_and_clear();
        }
    }
}

impl Default for RollingDisplay {
    fn default() -> Self {
        Self::new()
    }
}

fn truncate_line(line: &str) -> String {
    if line.chars().count() > MAX_LINE_WIDTH {
        let head: String = line.chars().take(TRUNCATED_WIDTH).collect();
        format!("{head}...")
    } else {
        line.to_string()
    }
}
