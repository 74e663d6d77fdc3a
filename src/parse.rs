//! Response body parsing.
//!
//! The effective parse kind for a response is decided in three steps: the
//! user's `determine_type` hook (when it names a concrete kind), then the
//! content-type tables, then the engine's configured default when the
//! response carries no content type at all. Unknown content types are parse
//! errors rather than silent byte passthrough.

use std::sync::OnceLock;

use bytes::Bytes;
use regex::Regex;
use serde_json::Value;

/// How a response body is decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseKind {
    /// JSON text; empty bodies decode to `Value::Null`.
    Json,
    /// UTF-8 text, including xml/html and urlencoded payloads.
    Text,
    /// Raw bytes (media, fonts, octet streams).
    Bytes,
    /// Form fields decoded to name/value pairs.
    Form,
}

impl std::fmt::Display for ParseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseKind::Json => f.write_str("json"),
            ParseKind::Text => f.write_str("text"),
            ParseKind::Bytes => f.write_str("bytes"),
            ParseKind::Form => f.write_str("form"),
        }
    }
}

/// Verdict of the `determine_type` hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeHint {
    /// Defer to the content-type tables / configured default.
    UseDefault,
    Kind(ParseKind),
}

/// A parsed response body.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Json(Value),
    Text(String),
    Bytes(Bytes),
    Form(Vec<(String, String)>),
}

impl Body {
    /// Deserialize a JSON body into a concrete type.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, ParseError> {
        match self {
            Body::Json(value) => {
                serde_json::from_value(value.clone()).map_err(ParseError::InvalidJson)
            }
            other => Err(ParseError::WrongKind { expected: ParseKind::Json, got: other.kind() }),
        }
    }

    pub fn kind(&self) -> ParseKind {
        match self {
            Body::Json(_) => ParseKind::Json,
            Body::Text(_) => ParseKind::Text,
            Body::Bytes(_) => ParseKind::Bytes,
            Body::Form(_) => ParseKind::Form,
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Body::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Body::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Body::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_form(&self) -> Option<&[(String, String)]> {
        match self {
            Body::Form(pairs) => Some(pairs),
            _ => None,
        }
    }

    /// Error-body rendering for `FetchError::data`: JSON bodies pass through,
    /// everything else collapses to `{ "message": … }`.
    pub(crate) fn into_error_data(self) -> Value {
        match self {
            Body::Json(Value::Null) => Value::Null,
            Body::Json(v) => v,
            Body::Text(s) if s.is_empty() => Value::Null,
            Body::Text(s) => serde_json::json!({ "message": s }),
            Body::Bytes(b) => serde_json::json!({ "message": format!("{} bytes", b.len()) }),
            Body::Form(pairs) => serde_json::json!({
                "message": pairs
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect::<Vec<_>>()
                    .join("&")
            }),
        }
    }
}

/// Body decoding failure.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("unsupported content type: {0}")]
    UnknownContentType(String),

    #[error("invalid JSON body: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("body is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("malformed form body: {0}")]
    InvalidForm(String),

    #[error("expected a {expected} body, got {got}")]
    WrongKind { expected: ParseKind, got: ParseKind },
}

fn text_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^text/|[+/]xml\b|html|x-www-form-urlencoded").expect("text table regex")
    })
}

fn json_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)[+/]json\b").expect("json table regex"))
}

fn form_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^multipart/form-data").expect("form table regex"))
}

fn bytes_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(image|audio|video|font|binary|application)/").expect("bytes table regex")
    })
}

/// Resolve the parse kind from a content-type header. `None` falls back to
/// `default`; an unrecognized value is an error.
pub fn kind_for_content_type(
    content_type: Option<&str>,
    default: ParseKind,
) -> Result<ParseKind, ParseError> {
    let Some(raw) = content_type else {
        return Ok(default);
    };
    let essence = raw.split(';').next().unwrap_or(raw).trim();
    if essence.is_empty() {
        return Ok(default);
    }
    // Order matters: application/json must resolve as JSON before the
    // catch-all application/* bytes row sees it.
    if json_re().is_match(essence) {
        Ok(ParseKind::Json)
    } else if text_re().is_match(essence) {
        Ok(ParseKind::Text)
    } else if form_re().is_match(essence) {
        Ok(ParseKind::Form)
    } else if bytes_re().is_match(essence) {
        Ok(ParseKind::Bytes)
    } else {
        Err(ParseError::UnknownContentType(raw.to_string()))
    }
}

/// Decode a body according to `kind`.
pub fn parse_body(
    kind: ParseKind,
    bytes: Bytes,
    content_type: Option<&str>,
) -> Result<Body, ParseError> {
    match kind {
        ParseKind::Json => {
            if bytes.is_empty() {
                Ok(Body::Json(Value::Null))
            } else {
                Ok(Body::Json(serde_json::from_slice(&bytes)?))
            }
        }
        ParseKind::Text => Ok(Body::Text(String::from_utf8(bytes.to_vec())?)),
        ParseKind::Bytes => Ok(Body::Bytes(bytes)),
        ParseKind::Form => parse_form(bytes, content_type),
    }
}

fn parse_form(bytes: Bytes, content_type: Option<&str>) -> Result<Body, ParseError> {
    if let Some(boundary) = content_type.and_then(multipart_boundary) {
        return parse_multipart(&bytes, &boundary);
    }
    let text = String::from_utf8(bytes.to_vec())?;
    let pairs = url::form_urlencoded::parse(text.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    Ok(Body::Form(pairs))
}

fn multipart_boundary(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.trim().split_once('=')?;
        if name.eq_ignore_ascii_case("boundary") {
            Some(value.trim_matches('"').to_string())
        } else {
            None
        }
    })
}

/// Minimal multipart decoder: text fields only, file parts surface as their
/// raw content. Enough for the form-data responses this engine consumes.
fn parse_multipart(bytes: &[u8], boundary: &str) -> Result<Body, ParseError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| ParseError::InvalidForm("multipart body is not UTF-8".to_string()))?;
    let delimiter = format!("--{}", boundary);
    let mut pairs = Vec::new();

    for part in text.split(delimiter.as_str()).skip(1) {
        let part = part.trim_start_matches("\r\n");
        if part.starts_with("--") || part.is_empty() {
            break;
        }
        let Some((headers, body)) = part.split_once("\r\n\r\n") else {
            return Err(ParseError::InvalidForm("part without header block".to_string()));
        };
        let name = headers
            .lines()
            .find(|l| l.to_ascii_lowercase().starts_with("content-disposition"))
            .and_then(|l| {
                l.split(';').find_map(|param| {
                    let (key, value) = param.trim().split_once('=')?;
                    (key == "name").then(|| value.trim_matches('"').to_string())
                })
            })
            .ok_or_else(|| ParseError::InvalidForm("part without a field name".to_string()))?;
        pairs.push((name, body.trim_end_matches("\r\n").to_string()));
    }

    Ok(Body::Form(pairs))
}
