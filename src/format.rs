use mime::Mime;

pub const UNKNOWN_EXTENSION: &str = "unknown";
const MAX_SNIFFED_EXTENSION_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    Png,
    Jpeg,
    Gif,
    Webp,
    Avif,
}

impl OutputFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim().to_ascii_lowercase().as_str() {
            "png" => Some(Self::Png),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "gif" => Some(Self::Gif),
            "webp" => Some(Self::Webp),
            "avif" => Some(Self::Avif),
            _ => None,
        }
    }

    /// Parses an `image/*` content type header value, ignoring parameters.
    pub fn from_content_type(value: &str) -> Option<Self> {
        let mime: Mime = value.trim().parse().ok()?;
        if mime.type_() != mime::IMAGE {
            return None;
        }
        Self::from_extension(mime.subtype().as_str())
    }

    pub fn mime(&self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::Gif => "image/gif",
            Self::Webp => "image/webp",
            Self::Avif => "image/avif",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpeg",
            Self::Gif => "gif",
            Self::Webp => "webp",
            Self::Avif => "avif",
        }
    }
}

/// A format as known at request time, before the source has been fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatHint {
    Known(OutputFormat),
    Unknown,
}

impl FormatHint {
    /// Returns `None` for anything outside the supported vocabulary.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.eq_ignore_ascii_case(UNKNOWN_EXTENSION) {
            return Some(Self::Unknown);
        }
        OutputFormat::from_extension(value).map(Self::Known)
    }

    pub fn known(&self) -> Option<OutputFormat> {
        match self {
            Self::Known(format) => Some(*format),
            Self::Unknown => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Known(format) => format.extension(),
            Self::Unknown => UNKNOWN_EXTENSION,
        }
    }
}

/// Extension of the last path segment of `url`, if it looks like a file
/// extension (at most four characters). Query and fragment are ignored.
pub fn sniff_extension(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let last_segment = path.rsplit('/').next().unwrap_or_default();
    let mut parts = last_segment.rsplitn(2, '.');
    let ext = parts.next()?;
    parts.next()?;
    let ext = ext.trim();
    if ext.is_empty() || ext.len() > MAX_SNIFFED_EXTENSION_LEN {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

pub fn content_type_from_name(name: &str) -> Option<&'static str> {
    let ext = name.rsplit('.').next()?;
    OutputFormat::from_extension(ext).map(|format| format.mime())
}
