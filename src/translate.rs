//! Path syntax translation
//!
//! Rewrites filesystem paths between the native mount syntax
//! (`/mnt/c/Users/me`) and the foreign drive-letter syntax (`C:\Users\me`)
//! inside JSON-RPC messages. Two granularities are offered:
//!
//! - **Structural**: locate every string value in the line and re-encode
//!   only the ones that are whole paths, splicing them into the original
//!   bytes. Keys, numbers, booleans, escapes and non-path strings keep their
//!   exact bytes.
//! - **Text**: substitute path occurrences directly in the raw line, then
//!   re-parse to make sure the message is still valid JSON.
//!
//! Translation never fails past this module: any problem yields the original
//! line unchanged.

use std::borrow::Cow;
use std::ops::Range;
use std::sync::{Arc, LazyLock};

use regex::{Captures, Regex};
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::io::transport::split_terminator;
use crate::metrics::BridgeMetrics;

/// Native mount root that precedes the drive letter
const MOUNT_ROOT: &str = "/mnt/";

/// `/mnt/<drive>...` inside raw JSON text. The lead group keeps URIs and
/// longer paths (`file:///mnt/c`, `/data/mnt/c`) out of the match.
static NATIVE_IN_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?P<lead>^|[^\w.~/\\-])/mnt/(?P<drive>[A-Za-z])(?P<tail>[^"\\\s]*)"#)
        .expect("native path pattern is valid")
});

/// `<DRIVE>:\\...` inside raw JSON text, where each backslash is escaped
static FOREIGN_IN_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?P<lead>^|[^\w.~/\\-])(?P<drive>[A-Za-z]):(?P<tail>\\\\(?:[^"\\\s]|\\\\)*)"#,
    )
    .expect("foreign path pattern is valid")
});

// ============================================================================
// Types
// ============================================================================

/// Granularity of path rewriting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranslationMode {
    /// Recursive walk over the parsed message
    #[default]
    Structural,
    /// Substitution on the raw message text
    Text,
}

/// Which way a message is travelling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client → downstream process: native paths become foreign
    ToForeign,
    /// Downstream process → client: foreign paths become native
    ToNative,
}

impl Direction {
    /// Apply this direction's whole-string transform
    pub fn translate<'a>(&self, s: &'a str) -> Cow<'a, str> {
        match self {
            Direction::ToForeign => to_foreign_syntax(s),
            Direction::ToNative => to_native_syntax(s),
        }
    }
}

/// Why a line was forwarded untranslated
#[derive(Debug, thiserror::Error)]
pub enum TranslationError {
    #[error("line is not valid UTF-8")]
    InvalidUtf8,

    #[error("malformed JSON: {0}")]
    MalformedJson(#[source] serde_json::Error),

    #[error("failed to serialize translated message: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("text substitution produced invalid JSON: {0}")]
    CorruptedOutput(#[source] serde_json::Error),
}

// ============================================================================
// String Transforms
// ============================================================================

/// Rewrite a whole native mount path (`/mnt/c/a/b`) as `C:\a\b`.
///
/// Any string that is not a mount path is returned unchanged.
pub fn to_foreign_syntax(s: &str) -> Cow<'_, str> {
    let Some(after_root) = s.strip_prefix(MOUNT_ROOT) else {
        return Cow::Borrowed(s);
    };
    let mut chars = after_root.chars();
    let Some(drive) = chars.next().filter(char::is_ascii_alphabetic) else {
        return Cow::Borrowed(s);
    };
    let rest = chars.as_str();
    if !(rest.is_empty() || rest.starts_with('/')) {
        return Cow::Borrowed(s);
    }

    let rest = rest.strip_prefix('/').unwrap_or(rest);
    Cow::Owned(format!(
        "{}:\\{}",
        drive.to_ascii_uppercase(),
        rest.replace('/', "\\")
    ))
}

/// Rewrite a whole drive-letter path (`C:\a\b` or `C:/a/b`) as `/mnt/c/a/b`.
///
/// Any string that is not a drive-letter path is returned unchanged.
pub fn to_native_syntax(s: &str) -> Cow<'_, str> {
    let mut chars = s.chars();
    let (Some(drive), Some(':'), Some(sep)) = (chars.next(), chars.next(), chars.next()) else {
        return Cow::Borrowed(s);
    };
    if !drive.is_ascii_alphabetic() || !(sep == '\\' || sep == '/') {
        return Cow::Borrowed(s);
    }

    let rest = chars.as_str();
    let mut native = format!("{MOUNT_ROOT}{}", drive.to_ascii_lowercase());
    if !rest.is_empty() {
        native.push('/');
        native.push_str(&rest.replace('\\', "/"));
    }
    Cow::Owned(native)
}

// ============================================================================
// Message Translation
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Container {
    Object { expect_key: bool },
    Array,
}

/// Byte ranges (quotes included) of every string token in `body` that is a
/// value rather than an object key.
///
/// `body` must already be known to be well-formed JSON.
fn string_value_spans(body: &str) -> Vec<Range<usize>> {
    let bytes = body.as_bytes();
    let mut stack: Vec<Container> = Vec::new();
    let mut spans = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i] != b'"' {
                    i += if bytes[i] == b'\\' { 2 } else { 1 };
                }
                let end = (i + 1).min(bytes.len());
                match stack.last_mut() {
                    Some(Container::Object { expect_key }) if *expect_key => *expect_key = false,
                    _ => spans.push(start..end),
                }
            }
            b'{' => stack.push(Container::Object { expect_key: true }),
            b'[' => stack.push(Container::Array),
            b'}' | b']' => {
                stack.pop();
            }
            b',' => {
                if let Some(Container::Object { expect_key }) = stack.last_mut() {
                    *expect_key = true;
                }
            }
            _ => {}
        }
        i += 1;
    }
    spans
}

/// Structural translation of one message body (no terminator).
///
/// Only string values that are whole paths are re-encoded and spliced back;
/// every other byte of `body` is kept. `Ok(None)` means nothing matched and
/// the original bytes must be kept.
pub fn translate_structural(
    body: &str,
    direction: Direction,
) -> Result<Option<(String, Vec<(String, String)>)>, TranslationError> {
    serde_json::from_str::<IgnoredAny>(body).map_err(TranslationError::MalformedJson)?;

    let mut out = String::with_capacity(body.len());
    let mut copied = 0;
    let mut rewritten = Vec::new();

    for span in string_value_spans(body) {
        let decoded: String =
            serde_json::from_str(&body[span.clone()]).map_err(TranslationError::MalformedJson)?;
        let Cow::Owned(translated) = direction.translate(&decoded) else {
            continue;
        };
        let encoded = serde_json::to_string(&translated).map_err(TranslationError::Serialize)?;
        out.push_str(&body[copied..span.start]);
        out.push_str(&encoded);
        copied = span.end;
        rewritten.push((decoded, translated));
    }

    if rewritten.is_empty() {
        return Ok(None);
    }
    out.push_str(&body[copied..]);
    Ok(Some((out, rewritten)))
}

/// Whole-message text translation of one message body (no terminator).
///
/// The body must be JSON before and after substitution.
pub fn translate_text(
    body: &str,
    direction: Direction,
) -> Result<Option<(String, Vec<(String, String)>)>, TranslationError> {
    serde_json::from_str::<IgnoredAny>(body).map_err(TranslationError::MalformedJson)?;

    let mut rewritten = Vec::new();
    let replaced = match direction {
        Direction::ToForeign => NATIVE_IN_TEXT.replace_all(body, |caps: &Captures| {
            let whole = &caps[0];
            let tail = &caps["tail"];
            if !(tail.is_empty() || tail.starts_with('/')) {
                return whole.to_string();
            }
            let drive = caps["drive"].to_ascii_uppercase();
            let rest = tail.strip_prefix('/').unwrap_or(tail);
            // JSON text needs each backslash escaped
            let foreign = format!("{drive}:\\\\{}", rest.replace('/', "\\\\"));
            rewritten.push((format!("{MOUNT_ROOT}{}{tail}", &caps["drive"]), foreign.clone()));
            format!("{}{foreign}", &caps["lead"])
        }),
        Direction::ToNative => FOREIGN_IN_TEXT.replace_all(body, |caps: &Captures| {
            let drive = caps["drive"].to_ascii_lowercase();
            let tail = caps["tail"].replace("\\\\", "/");
            let rest = tail.strip_prefix('/').unwrap_or(&tail);
            let mut native = format!("{MOUNT_ROOT}{drive}");
            if !rest.is_empty() {
                native.push('/');
                native.push_str(rest);
            }
            rewritten.push((format!("{}:{}", &caps["drive"], &caps["tail"]), native.clone()));
            format!("{}{native}", &caps["lead"])
        }),
    };

    match replaced {
        Cow::Borrowed(_) => Ok(None),
        Cow::Owned(_) if rewritten.is_empty() => Ok(None),
        Cow::Owned(text) => {
            serde_json::from_str::<IgnoredAny>(&text)
                .map_err(TranslationError::CorruptedOutput)?;
            Ok(Some((text, rewritten)))
        }
    }
}

// ============================================================================
// Line Translator
// ============================================================================

/// Applies path translation to framed lines as they cross the bridge
#[derive(Debug, Clone)]
pub struct PathTranslator {
    enabled: bool,
    mode: TranslationMode,
    metrics: Option<Arc<BridgeMetrics>>,
}

impl PathTranslator {
    /// Create a translator; a disabled translator forwards everything as-is
    pub fn new(enabled: bool, mode: TranslationMode) -> Self {
        Self {
            enabled,
            mode,
            metrics: None,
        }
    }

    /// Record translations and failures into `metrics`
    pub fn with_metrics(mut self, metrics: Arc<BridgeMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Translate one framed line, keeping its terminator.
    ///
    /// Returns the input untouched when translation is disabled, nothing
    /// matched, or the line could not be handled.
    pub fn translate_line<'a>(&self, line: &'a [u8], direction: Direction) -> Cow<'a, [u8]> {
        if !self.enabled {
            return Cow::Borrowed(line);
        }

        let (body, terminator) = split_terminator(line);
        if body.iter().all(u8::is_ascii_whitespace) {
            return Cow::Borrowed(line);
        }

        match self.translate_body(body, direction) {
            Ok(None) => Cow::Borrowed(line),
            Ok(Some((translated, rewritten))) => {
                if let Some(metrics) = &self.metrics {
                    for (from, to) in &rewritten {
                        metrics.record_path_translation(from, to);
                    }
                }
                trace!(
                    "Translated {} path(s) {:?}: {:?}",
                    rewritten.len(),
                    direction,
                    rewritten
                );
                let mut out = translated.into_bytes();
                out.extend_from_slice(terminator);
                Cow::Owned(out)
            }
            Err(e) => {
                match &e {
                    TranslationError::InvalidUtf8 | TranslationError::MalformedJson(_) => {
                        debug!("Forwarding line untranslated ({:?}): {}", direction, e)
                    }
                    _ => warn!("Path translation failed ({:?}), forwarding original: {}", direction, e),
                }
                if let Some(metrics) = &self.metrics {
                    metrics.record_error("translation_error", Some(e.to_string()));
                }
                Cow::Borrowed(line)
            }
        }
    }

    fn translate_body(
        &self,
        body: &[u8],
        direction: Direction,
    ) -> Result<Option<(String, Vec<(String, String)>)>, TranslationError> {
        let body = std::str::from_utf8(body).map_err(|_| TranslationError::InvalidUtf8)?;
        match self.mode {
            TranslationMode::Structural => translate_structural(body, direction),
            TranslationMode::Text => translate_text(body, direction),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
