//! ビルド入力（image.nix）のレンダリング
//!
//! 固定テンプレートを Tera で展開します。文字列値はすべて専用フィルターを
//! 通してから埋め込むので、ユーザー入力で構文が壊れることはありません。

use crate::error::{CoreError, Result};
use crate::model::Configuration;
use std::collections::HashMap;
use tera::{Context, Tera, Value};

/// テンプレートのバージョン（出力の先頭に記録される）
pub const TEMPLATE_VERSION: u32 = 3;

const TEMPLATE_NAME: &str = "image.nix";
const IMAGE_TEMPLATE: &str = include_str!("../templates/image.nix.tera");

/// テンプレートレンダラー
pub struct TemplateRenderer {
    tera: Tera,
}

impl TemplateRenderer {
    /// 組み込みテンプレートで初期化
    pub fn new() -> Result<Self> {
        Self::with_template(IMAGE_TEMPLATE)
    }

    /// 任意のテンプレート本文で初期化
    pub fn with_template(source: &str) -> Result<Self> {
        let mut tera = Tera::default();
        tera.autoescape_on(vec![]);
        tera.register_filter("nix_str", nix_str_filter);
        tera.register_filter("nix_indented", nix_indented_filter);
        tera.add_raw_template(TEMPLATE_NAME, source)
            .map_err(|e| CoreError::Template(extract_tera_error_detail(&e)))?;
        Ok(Self { tera })
    }

    /// 設定からビルド入力を生成
    pub fn render(&self, config: &Configuration) -> Result<String> {
        let context = build_context(config)?;
        self.tera
            .render(TEMPLATE_NAME, &context)
            .map_err(|e| CoreError::Template(extract_tera_error_detail(&e)))
    }
}

fn build_context(config: &Configuration) -> Result<Context> {
    if config.username.trim().is_empty() {
        return Err(CoreError::Template(
            "username が空です".to_string(),
        ));
    }

    let compose_enabled = config.compose.is_active();
    let compose_content = if compose_enabled {
        config.compose.rewritten().ok_or_else(|| {
            CoreError::Template(
                "docker_compose が有効ですが、イメージの埋め込みが完了していません".to_string(),
            )
        })?
    } else {
        ""
    };

    let networks: Vec<Value> = config
        .wireless
        .networks
        .iter()
        .map(|(ssid, credential)| serde_json::json!({ "ssid": ssid, "psk": credential.psk }))
        .collect();

    let images: Vec<Value> = config
        .compose
        .images()
        .iter()
        .map(|image| {
            serde_json::json!({
                "canonical": image.canonical,
                "local_tag": image.local_tag,
                "archive_path": image.archive_path.display().to_string(),
                "file_name": image.archive_file_name().unwrap_or_default(),
            })
        })
        .collect();

    let mut context = Context::new();
    context.insert("template_version", &TEMPLATE_VERSION);
    context.insert("username", &config.username);
    context.insert("ssh_keys", &config.ssh_keys);
    context.insert(
        "wireless",
        &serde_json::json!({
            "enabled": config.wireless.enabled,
            "networks": networks,
        }),
    );
    context.insert(
        "compose",
        &serde_json::json!({
            "enabled": compose_enabled,
            "content": compose_content,
            "images": images,
        }),
    );
    context.insert("autodiscovery", &config.autodiscovery);
    // エージェントは自動探索が有効なときだけ組み込む
    let agent_binary = config
        .agent_binary
        .as_ref()
        .filter(|_| config.autodiscovery)
        .map(|path| path.display().to_string());
    context.insert("agent_binary", &agent_binary);

    Ok(context)
}

/// Nix の二重引用符文字列として安全な形にする
pub fn escape_nix_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '$' if chars.peek() == Some(&'{') => out.push_str("\\$"),
            _ => out.push(c),
        }
    }
    out
}

/// Nix のインデント文字列 (`'' ... ''`) として安全な形にする
///
/// `${` は文字列の埋め込みで表す（直前の `'` と合わせて `'''` と読まれないように）。
pub fn escape_nix_indented(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(c) = rest.chars().next() {
        if let Some(tail) = rest.strip_prefix("''") {
            out.push_str("'''");
            rest = tail;
        } else if let Some(tail) = rest.strip_prefix("${") {
            out.push_str(r#"${"\${"}"#);
            rest = tail;
        } else {
            out.push(c);
            rest = &rest[c.len_utf8()..];
        }
    }
    out
}

fn nix_str_filter(value: &Value, _: &HashMap<String, Value>) -> tera::Result<Value> {
    match value {
        Value::String(s) => Ok(Value::String(escape_nix_string(s))),
        Value::Null => Ok(Value::String(String::new())),
        other => Ok(Value::String(escape_nix_string(&other.to_string()))),
    }
}

fn nix_indented_filter(value: &Value, _: &HashMap<String, Value>) -> tera::Result<Value> {
    match value {
        Value::String(s) => Ok(Value::String(escape_nix_indented(s))),
        _ => Err(tera::Error::msg("nix_indented は文字列にのみ使えます")),
    }
}

/// Teraエラーから詳細情報を抽出
fn extract_tera_error_detail(e: &tera::Error) -> String {
    use std::error::Error;

    let mut details = vec![e.to_string()];
    let mut source = e.source();
    while let Some(err) = source {
        details.push(err.to_string());
        source = err.source();
    }
    let full_error = details.join(" | ");

    if let Some(start) = full_error.find("Variable `")
        && let Some(end) = full_error[start..].find("` not found")
    {
        let var_name = &full_error[start + 10..start + end];
        return format!("未定義の変数: `{var_name}`");
    }

    full_error
}
