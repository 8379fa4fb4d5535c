//! User-facing status lines

use serde::Serialize;
use std::fmt;

/// Broad category of a status line, for styling and scripting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    #[default]
    Info,
    Waiting,
    Monitoring,
    RateLimited,
    Completed,
    Cancelled,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusLine {
    pub kind: StatusKind,
    pub text: String,
}

impl StatusLine {
    pub fn new(kind: StatusKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new(StatusKind::Error, text)
    }
}

impl fmt::Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

pub(crate) const WAITING: &str = "待機中...";
pub(crate) const CANCELLED: &str = "実行を中止しました";
pub(crate) const COMPLETED: &str = "処理完了";
pub(crate) const RATE_LIMIT_STOPPED: &str = "Rate limitを検出したため終了しました";
pub(crate) const MONITORING_ENDED: &str = "監視を終了しました";
pub(crate) const RUN_FINISHED: &str = "実行完了";
