use crate::format::OutputFormat;
use std::collections::HashMap;

pub const PRESET_ENV_PREFIX: &str = "PRESET_";
pub const DEFAULT_POSITION: &str = "center";
const MAX_QUALITY: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Fit {
    #[default]
    Cover,
    Contain,
    Fill,
    Inside,
    Outside,
}

impl Fit {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "cover" => Some(Self::Cover),
            "contain" => Some(Self::Contain),
            "fill" => Some(Self::Fill),
            "inside" => Some(Self::Inside),
            "outside" => Some(Self::Outside),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cover => "cover",
            Self::Contain => "contain",
            Self::Fill => "fill",
            Self::Inside => "inside",
            Self::Outside => "outside",
        }
    }
}

/// Normalized transformation parameters, immutable once resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformSpec {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub quality: Option<u8>,
    pub fit: Fit,
    pub position: String,
    pub output: Option<OutputFormat>,
}

impl Default for TransformSpec {
    fn default() -> Self {
        Self {
            width: None,
            height: None,
            quality: None,
            fit: Fit::default(),
            position: DEFAULT_POSITION.to_string(),
            output: None,
        }
    }
}

impl TransformSpec {
    /// Parses a `key:value,key:value` descriptor. Only `w`, `h`, `q`, `f`, `p`
    /// and `o` are recognized; anything else, and values that do not parse for
    /// their key, are dropped so the defaults stay in effect.
    pub fn parse(descriptor: &str) -> Self {
        let mut spec = Self::default();
        for piece in descriptor.split(',') {
            let mut parts = piece.split(':');
            let key = parts.next().unwrap_or_default().trim();
            let Some(value) = parts.next() else {
                continue;
            };
            let value = value.trim();
            match key {
                "w" => spec.width = parse_dimension(value).or(spec.width),
                "h" => spec.height = parse_dimension(value).or(spec.height),
                "q" => spec.quality = parse_quality(value).or(spec.quality),
                "f" => {
                    if let Some(fit) = Fit::parse(value) {
                        spec.fit = fit;
                    }
                }
                "p" => {
                    if !value.is_empty() {
                        spec.position = value.to_ascii_lowercase();
                    }
                }
                "o" => spec.output = OutputFormat::from_extension(value).or(spec.output),
                _ => {}
            }
        }
        spec
    }

    /// `key:value` pairs sorted by key with absent fields omitted.
    pub fn canonical(&self) -> String {
        let mut pairs = vec![
            format!("f:{}", self.fit.as_str()),
            format!("p:{}", self.position),
        ];
        if let Some(height) = self.height {
            pairs.push(format!("h:{height}"));
        }
        if let Some(output) = self.output {
            pairs.push(format!("o:{}", output.extension()));
        }
        if let Some(quality) = self.quality {
            pairs.push(format!("q:{quality}"));
        }
        if let Some(width) = self.width {
            pairs.push(format!("w:{width}"));
        }
        pairs.sort();
        pairs.join(",")
    }
}

fn parse_dimension(value: &str) -> Option<u32> {
    value.parse::<u32>().ok().filter(|value| *value > 0)
}

fn parse_quality(value: &str) -> Option<u8> {
    let quality = value.parse::<i64>().ok()?;
    Some(quality.clamp(1, MAX_QUALITY) as u8)
}

/// Named transformations loaded once at startup, keyed by lower-cased name.
#[derive(Debug, Clone, Default)]
pub struct PresetTable {
    presets: HashMap<String, TransformSpec>,
}

impl PresetTable {
    /// Collects every `PRESET_<NAME>=<descriptor>` pair.
    pub fn from_vars<I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut table = Self::default();
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(PRESET_ENV_PREFIX) else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            table.insert(name, &value);
        }
        table
    }

    pub fn insert(&mut self, name: &str, descriptor: &str) {
        self.presets
            .insert(name.to_ascii_lowercase(), TransformSpec::parse(descriptor));
    }

    pub fn get(&self, name: &str) -> Option<&TransformSpec> {
        self.presets.get(&name.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.presets.len()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.presets.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Resolves the transformation path segment. Presets win; custom descriptors
/// are only parsed when enabled. `None` means "serve the original".
pub fn resolve_transform(
    token: &str,
    presets: &PresetTable,
    allow_custom: bool,
) -> Option<TransformSpec> {
    let token = token.to_ascii_lowercase();
    if let Some(preset) = presets.get(&token) {
        return Some(preset.clone());
    }
    if allow_custom {
        return Some(TransformSpec::parse(&token));
    }
    None
}
