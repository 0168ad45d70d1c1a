//! コンテナ仕様の変数展開
//!
//! `${VAR}`、`${VAR:-default}`、`${VAR-default}`、`$VAR`、`$$` を扱います。
//! 値は環境変数、次に仕様と同じディレクトリの `.env` から引きます。

use crate::error::{CoreError, Result};
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;
use tracing::{debug, warn};

static VARIABLE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\$(?:(?P<escaped>\$)|\{(?P<braced>[A-Za-z_][A-Za-z0-9_]*)(?:(?P<op>:?-)(?P<default>[^}]*))?\}|(?P<named>[A-Za-z_][A-Za-z0-9_]*))",
    )
    .expect("interpolation pattern is valid")
});

/// 変数展開器
#[derive(Debug, Clone, Default)]
pub struct Interpolator {
    env: HashMap<String, String>,
    file_vars: HashMap<String, String>,
}

impl Interpolator {
    /// 空の展開器（未定義変数はすべて空文字）
    pub fn new() -> Self {
        Self::default()
    }

    /// プロセスの環境変数を取り込む
    pub fn from_env() -> Self {
        Self {
            env: std::env::vars().collect(),
            file_vars: HashMap::new(),
        }
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// `.env` ファイルを読み込む（存在しなければ何もしない）
    ///
    /// 環境変数と重なるキーは環境変数が優先されます。
    pub fn with_env_file(mut self, path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Ok(self);
        }
        let content = std::fs::read_to_string(path).map_err(|e| CoreError::io(path, e))?;
        let mut count = 0;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);
            if let Some((key, value)) = line.split_once('=') {
                self.file_vars
                    .insert(key.trim().to_string(), strip_quotes(value.trim()).to_string());
                count += 1;
            }
        }
        debug!(env_file = %path.display(), variable_count = count, "Loaded .env variables");
        Ok(self)
    }

    fn lookup(&self, name: &str) -> Option<&str> {
        self.env
            .get(name)
            .or_else(|| self.file_vars.get(name))
            .map(String::as_str)
    }

    /// 文字列中の変数参照を展開
    pub fn interpolate(&self, text: &str) -> String {
        VARIABLE_PATTERN
            .replace_all(text, |caps: &Captures| self.expand(caps))
            .into_owned()
    }

    fn expand(&self, caps: &Captures) -> String {
        if caps.name("escaped").is_some() {
            return "$".to_string();
        }

        let name = caps
            .name("braced")
            .or_else(|| caps.name("named"))
            .map(|m| m.as_str())
            .unwrap_or_default();
        let value = self.lookup(name);

        match caps.name("op").map(|m| m.as_str()) {
            Some(":-") => match value {
                Some(v) if !v.is_empty() => v.to_string(),
                _ => default_of(caps),
            },
            Some(_) => match value {
                Some(v) => v.to_string(),
                None => default_of(caps),
            },
            None => match value {
                Some(v) => v.to_string(),
                None => {
                    warn!(variable = %name, "Variable is not set, substituting an empty string");
                    String::new()
                }
            },
        }
    }
}

fn default_of(caps: &Captures) -> String {
    caps.name("default")
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

/// "value" や 'value' のクォートを除去
fn strip_quotes(s: &str) -> &str {
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        &s[1..s.len() - 1]
    } else {
        s
    }
}
