//! Maps raw failures onto the small error taxonomy surfaced on the wire.
//!
//! Classification is an ordered rule table matched case-insensitively against
//! `message + "\n" + stderr`; the first matching rule wins and the fallback is
//! `unknown`, non-retryable.

use std::sync::LazyLock;

use regex_lite::Regex;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::error::GatewayErr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AuthError,
    CliMissing,
    WorkspaceMissing,
    FsPermission,
    InternalCliFailure,
    Cancelled,
    Timeout,
    Unknown,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::AuthError => "auth_error",
            ErrorCode::CliMissing => "cli_missing",
            ErrorCode::WorkspaceMissing => "workspace_missing",
            ErrorCode::FsPermission => "fs_permission",
            ErrorCode::InternalCliFailure => "internal_cli_failure",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Unknown => "unknown",
        }
    }
}

/// A failure normalized for the wire. `original` keeps the source error's
/// debug form for logs only; it is never serialized.
#[derive(Debug, Clone, Serialize)]
pub struct ClassifiedError {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Map<String, Value>>,
    #[serde(skip)]
    pub original: Option<String>,
}

impl std::fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for ClassifiedError {}

impl ClassifiedError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: false,
            meta: None,
            original: None,
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorCode::Cancelled, "operation cancelled")
    }

    pub fn timeout() -> Self {
        Self::new(ErrorCode::Timeout, "timed out waiting for model output")
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.meta
            .get_or_insert_with(serde_json::Map::new)
            .insert(key.to_string(), value.into());
        self
    }
}

struct Rule {
    pattern: &'static LazyLock<Regex>,
    code: ErrorCode,
    retryable: bool,
}

macro_rules! rule_regex {
    ($name:ident, $re:literal) => {
        static $name: LazyLock<Regex> = LazyLock::new(|| {
            #[allow(clippy::expect_used)]
            let re = Regex::new($re).expect("classifier rule must compile");
            re
        });
    };
}

rule_regex!(RE_AUTH, r"(?i)api key|authentication");
// Both substrings must be present, in either order.
rule_regex!(RE_CLI_MISSING, r"(?is)not found.*claude|claude.*not found");
rule_regex!(RE_NO_REPO, r"(?i)not a git repository");
rule_regex!(RE_PERMISSION, r"(?i)permission denied|eacces");
rule_regex!(
    RE_RUNTIME_CRASH,
    r"(?im)referenceerror|typeerror|syntaxerror|^\s*at .+:\d+:\d+"
);
rule_regex!(RE_CANCELLED, r"(?i)cancell?ed");
rule_regex!(RE_TIMEOUT, r"(?i)timed? ?out");

/// Rule order is significant: the first match wins. `auth_error` and
/// `cli_missing` stay non-retryable so callers re-auth or install tooling
/// instead of looping.
static RULES: &[Rule] = &[
    Rule {
        pattern: &RE_AUTH,
        code: ErrorCode::AuthError,
        retryable: false,
    },
    Rule {
        pattern: &RE_CLI_MISSING,
        code: ErrorCode::CliMissing,
        retryable: false,
    },
    Rule {
        pattern: &RE_NO_REPO,
        code: ErrorCode::WorkspaceMissing,
        retryable: false,
    },
    Rule {
        pattern: &RE_PERMISSION,
        code: ErrorCode::FsPermission,
        retryable: false,
    },
    Rule {
        pattern: &RE_RUNTIME_CRASH,
        code: ErrorCode::InternalCliFailure,
        retryable: false,
    },
    Rule {
        pattern: &RE_CANCELLED,
        code: ErrorCode::Cancelled,
        retryable: false,
    },
    Rule {
        pattern: &RE_TIMEOUT,
        code: ErrorCode::Timeout,
        retryable: false,
    },
];

/// Classify a raw error message plus whatever stderr was captured alongside.
pub fn classify(message: &str, stderr: Option<&str>) -> ClassifiedError {
    let haystack = match stderr {
        Some(stderr) if !stderr.is_empty() => format!("{message}\n{stderr}"),
        _ => message.to_string(),
    };

    for rule in RULES {
        if rule.pattern.is_match(&haystack) {
            let mut classified = ClassifiedError::new(rule.code, message.to_string());
            classified.retryable = rule.retryable;
            if let Some(stderr) = stderr
                && !stderr.is_empty()
            {
                classified = classified.with_meta("stderr", stderr);
            }
            return classified;
        }
    }

    let mut classified = ClassifiedError::new(ErrorCode::Unknown, message.to_string());
    if let Some(stderr) = stderr
        && !stderr.is_empty()
    {
        classified = classified.with_meta("stderr", stderr);
    }
    classified
}

impl From<GatewayErr> for ClassifiedError {
    fn from(err: GatewayErr) -> Self {
        let mut classified = match &err {
            GatewayErr::Cancelled => ClassifiedError::cancelled(),
            GatewayErr::Timeout => ClassifiedError::timeout(),
            GatewayErr::PathEscapesWorkspace(_) => {
                ClassifiedError::new(ErrorCode::FsPermission, err.to_string())
            }
            _ => classify(&err.to_string(), err.stderr()),
        };
        classified.original = Some(format!("{err:?}"));
        classified
    }
}
