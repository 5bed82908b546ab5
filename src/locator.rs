use crate::format::OutputFormat;
use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use tracing::warn;
use url::form_urlencoded;

pub type QueryPairs = Vec<(String, String)>;

const ENVELOPE_PREFIX: &str = "b64:";
const CAST_MARKER: &str = ":o.";
pub const DEFAULT_SCALE: u8 = 1;

/// The source locator after envelope decoding and prefix/suffix extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLocator {
    pub url: String,
    pub query: QueryPairs,
    pub scale: u8,
    pub cast: Option<String>,
}

impl ResolvedLocator {
    /// The canonical URL with its query string reattached.
    pub fn requested_url(&self) -> String {
        if self.query.is_empty() {
            return self.url.clone();
        }
        format!("{}?{}", self.url, serialize_query(&self.query))
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

pub fn resolve_locator(raw: &str, query: QueryPairs, accept: &str) -> ResolvedLocator {
    let (mut url, query) = decode_envelope(raw, query);
    let mut scale = DEFAULT_SCALE;
    if let Some((factor, rest)) = split_scale_prefix(&url) {
        scale = factor;
        url = rest.to_string();
    }
    let mut cast = None;
    if let Some((base, format)) = split_cast_suffix(&url) {
        if let Some(format) = negotiate_cast(accept, format) {
            cast = Some(format);
            url = base.to_string();
        }
    }
    ResolvedLocator {
        url,
        query,
        scale,
        cast,
    }
}

pub fn parse_query(raw: Option<&str>) -> QueryPairs {
    match raw {
        Some(raw) if !raw.is_empty() => form_urlencoded::parse(raw.as_bytes())
            .into_owned()
            .collect(),
        _ => Vec::new(),
    }
}

pub fn serialize_query(query: &QueryPairs) -> String {
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(query.iter())
        .finish()
}

/// Decodes a `b64:` envelope. A decoded `?` splits off a query string that
/// replaces the caller's query. Decode failures keep the raw locator.
fn decode_envelope(raw: &str, query: QueryPairs) -> (String, QueryPairs) {
    let Some(payload) = strip_prefix_ignore_case(raw, ENVELOPE_PREFIX) else {
        return (raw.to_string(), query);
    };
    let decoded = match decode_base64(payload) {
        Ok(decoded) => decoded,
        Err(err) => {
            warn!(error = %err, locator = %raw, "base64 locator decode failed");
            return (raw.to_string(), query);
        }
    };
    match decoded.split_once('?') {
        Some((url, fragment)) => (url.to_string(), parse_query(Some(fragment))),
        None => (decoded, query),
    }
}

fn decode_base64(payload: &str) -> anyhow::Result<String> {
    let normalized: String = payload
        .chars()
        .filter(|ch| !ch.is_whitespace() && *ch != '=')
        .map(|ch| match ch {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();
    let bytes = STANDARD_NO_PAD.decode(normalized.as_bytes())?;
    Ok(String::from_utf8(bytes)?)
}

/// Matches `^[1-3]x/` case-insensitively.
fn split_scale_prefix(url: &str) -> Option<(u8, &str)> {
    let bytes = url.as_bytes();
    if bytes.len() < 3 {
        return None;
    }
    let factor = match bytes[0] {
        b'1'..=b'3' => bytes[0] - b'0',
        _ => return None,
    };
    if !bytes[1].eq_ignore_ascii_case(&b'x') || bytes[2] != b'/' {
        return None;
    }
    Some((factor, &url[3..]))
}

/// Splits `<url>:o.<format>` at the last marker.
fn split_cast_suffix(url: &str) -> Option<(&str, &str)> {
    let index = url.rfind(CAST_MARKER)?;
    let format = &url[index + CAST_MARKER.len()..];
    if format.is_empty() {
        return None;
    }
    Some((&url[..index], format))
}

/// Coarse negotiation: the Accept header must mention the format's MIME
/// type. Known formats come back under their canonical extension so `jpg`
/// and `jpeg` casts share one cache entry.
fn negotiate_cast(accept: &str, format: &str) -> Option<String> {
    let accept = accept.to_ascii_lowercase();
    let (mime, cast) = match OutputFormat::from_extension(format) {
        Some(known) => (known.mime().to_string(), known.extension().to_string()),
        None => {
            let format = format.to_ascii_lowercase();
            (format!("image/{format}"), format)
        }
    };
    accept.contains(&mime).then_some(cast)
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&value[prefix.len()..])
    } else {
        None
    }
}
