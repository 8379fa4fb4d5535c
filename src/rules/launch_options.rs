//! Validation of free-text extra launch options
//!
//! Extra options are pasted verbatim into the shell command line, after the
//! flags generated from structured settings. They must not override those
//! flags and must not break the quoting of the instruction that follows.

use crate::tool::ToolIdentity;

/// Why a set of extra launch options was refused.
///
/// The `Display` text is the user-facing reason shown next to the field.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LaunchOptionsError {
    #[error("追加オプションに改行は使用できません")]
    Newline,

    #[error("追加オプションの引用符が閉じられていません")]
    UnbalancedQuotes,

    #[error("追加オプションの末尾がエスケープ文字で終わっています")]
    DanglingEscape,

    #[error("{flag} は設定項目で指定してください（追加オプションでは使用できません）")]
    ReservedFlag { flag: &'static str },
}

impl LaunchOptionsError {
    /// The colliding flag, for reserved-flag errors
    pub fn flag(&self) -> Option<&'static str> {
        match self {
            LaunchOptionsError::ReservedFlag { flag } => Some(*flag),
            _ => None,
        }
    }
}

/// Flags already controlled by structured settings, per tool.
pub fn reserved_flags(tool: ToolIdentity) -> &'static [&'static str] {
    match tool {
        ToolIdentity::Claude => &[
            "--model",
            "--dangerously-skip-permissions",
            "--permission-mode",
        ],
        ToolIdentity::Codex => &[
            "--model",
            "-m",
            "--approval-mode",
            "--ask-for-approval",
            "-a",
            "--full-auto",
            "--dangerously-bypass-approvals-and-sandbox",
            "--sandbox",
            "-s",
            "--search",
        ],
        ToolIdentity::Gemini => &[
            "--model",
            "-m",
            "--approval-mode",
            "--yolo",
            "-y",
            "--sandbox",
            "--output-format",
            "-o",
            "--include-directories",
            "--prompt",
            "-p",
        ],
    }
}

/// Check extra launch options for `tool`.
pub fn validate_launch_options(tool: ToolIdentity, options: &str) -> Result<(), LaunchOptionsError> {
    if options.contains('\n') || options.contains('\r') {
        return Err(LaunchOptionsError::Newline);
    }
    check_quotes(options)?;
    if let Some(flag) = find_reserved_flag(tool, options) {
        return Err(LaunchOptionsError::ReservedFlag { flag });
    }
    Ok(())
}

/// Sequential quote scan.
///
/// Backslash escapes the next character except inside single quotes, where
/// the shell treats it literally. A quote of the other kind inside an open
/// quote is plain text.
fn check_quotes(options: &str) -> Result<(), LaunchOptionsError> {
    let mut in_single = false;
    let mut in_double = false;
    let mut escaped = false;

    for c in options.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if !in_single => escaped = true,
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            _ => {}
        }
    }

    if escaped {
        return Err(LaunchOptionsError::DanglingEscape);
    }
    if in_single || in_double {
        return Err(LaunchOptionsError::UnbalancedQuotes);
    }
    Ok(())
}

/// First reserved flag appearing as its own token.
///
/// A token starts at the beginning of the string or after whitespace and
/// ends at whitespace, `=` or the end of the string.
fn find_reserved_flag(tool: ToolIdentity, options: &str) -> Option<&'static str> {
    reserved_flags(tool)
        .iter()
        .copied()
        .find(|flag| contains_flag_token(options, flag))
}

fn contains_flag_token(options: &str, flag: &str) -> bool {
    options.match_indices(flag).any(|(start, _)| {
        let left_ok = options[..start]
            .chars()
            .next_back()
            .is_none_or(char::is_whitespace);
        let right_ok = options[start + flag.len()..]
            .chars()
            .next()
            .is_none_or(|c| c.is_whitespace() || c == '=');
        left_ok && right_ok
    })
}
