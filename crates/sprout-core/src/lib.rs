//! Sprout のコアモデル
//!
//! 設定ファイルの読み込み、コンテナ仕様のイメージ解決、
//! ビルド入力のレンダリングを提供します。

pub mod compose;
pub mod error;
pub mod interpolate;
pub mod loader;
pub mod model;
pub mod template;

pub use compose::{ImageResolver, archive_file_name, local_tag_for, sanitize_reference};
pub use error::{CoreError, Result};
pub use interpolate::Interpolator;
pub use loader::ConfigLoader;
pub use model::*;
pub use template::{TEMPLATE_VERSION, TemplateRenderer};
