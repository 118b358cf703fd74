//! Synthesis descriptors: the parameter set that decides what audio a request produces.
//! Missing fields are coerced to fixed defaults so incomplete descriptors still key
//! consistently, and text fields are normalized before keying or comparison.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

pub const DEFAULT_LANG: &str = "en-US";
pub const DEFAULT_VOICE: &str = "default";
pub const DEFAULT_MODEL: &str = "default";
pub const DEFAULT_FORMAT: &str = "mp3";
pub const DEFAULT_RATE: f32 = 1.0;
pub const DEFAULT_PITCH: f32 = 0.0;

/// Extension used when a declared format is not in the supported table.
pub const FALLBACK_EXTENSION: &str = ".mp3";

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern is valid"));

/// A synthesis request as callers build it. Any field except `text` may be left unset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisDescriptor {
    pub text: String,
    #[serde(default)]
    pub lang: Option<String>,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// Disambiguates otherwise-identical requests (e.g. "praise" vs "prompt").
    #[serde(default)]
    pub flavor: Option<String>,
    #[serde(default)]
    pub rate: Option<f32>,
    #[serde(default)]
    pub pitch: Option<f32>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub sample_rate: Option<u32>,
}

impl SynthesisDescriptor {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_lang(mut self, lang: impl Into<String>) -> Self {
        self.lang = Some(lang.into());
        self
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_flavor(mut self, flavor: impl Into<String>) -> Self {
        self.flavor = Some(flavor.into());
        self
    }

    pub fn with_rate(mut self, rate: f32) -> Self {
        self.rate = Some(rate);
        self
    }

    pub fn with_pitch(mut self, pitch: f32) -> Self {
        self.pitch = Some(pitch);
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = Some(sample_rate);
        self
    }

    /// Apply defaults, producing the fully populated form stored alongside each clip.
    pub fn resolve(&self) -> DescriptorMeta {
        DescriptorMeta {
            text: collapse_whitespace(&self.text),
            lang: or_default(self.lang.as_deref(), DEFAULT_LANG),
            voice: or_default(self.voice.as_deref(), DEFAULT_VOICE),
            model: or_default(self.model.as_deref(), DEFAULT_MODEL),
            flavor: self.flavor.as_deref().map(str::trim).unwrap_or_default().to_string(),
            rate: finite_or(self.rate, DEFAULT_RATE),
            pitch: finite_or(self.pitch, DEFAULT_PITCH),
            format: or_default(self.format.as_deref(), DEFAULT_FORMAT),
            sample_rate: self.sample_rate.filter(|&sr| sr > 0),
        }
    }
}

/// Defaulted descriptor fields, denormalized onto every clip record and written into
/// archive manifests as `meta`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptorMeta {
    pub text: String,
    pub lang: String,
    pub voice: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub flavor: String,
    pub rate: f32,
    pub pitch: f32,
    pub format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
}

impl DescriptorMeta {
    /// Back to a request descriptor with every field populated.
    pub fn to_descriptor(&self) -> SynthesisDescriptor {
        SynthesisDescriptor {
            text: self.text.clone(),
            lang: Some(self.lang.clone()),
            voice: Some(self.voice.clone()),
            model: Some(self.model.clone()),
            flavor: Some(self.flavor.clone()).filter(|f| !f.is_empty()),
            rate: Some(self.rate),
            pitch: Some(self.pitch),
            format: Some(self.format.clone()),
            sample_rate: self.sample_rate,
        }
    }

    /// Canonical serialization: normalized fields in fixed order, unit-separator joined.
    pub fn canonical(&self) -> String {
        [
            normalize_text(&self.text),
            normalize_text(&self.lang),
            normalize_text(&self.voice),
            normalize_text(&self.model),
            normalize_text(&self.flavor),
            canonical_float(self.rate),
            canonical_float(self.pitch),
            normalize_text(&self.format),
            self.sample_rate.unwrap_or(0).to_string(),
        ]
        .join("\u{1f}")
    }

    /// Fields that make two records "the same utterance" regardless of rate, pitch or
    /// output format.
    pub fn equivalence_fields(&self) -> [String; 5] {
        [
            normalize_text(&self.text),
            normalize_text(&self.lang),
            normalize_text(&self.voice),
            normalize_text(&self.model),
            normalize_text(&self.flavor),
        ]
    }

    pub fn audio_format(&self) -> Option<AudioFormat> {
        AudioFormat::from_declared(&self.format)
    }

    /// File extension for this record's payload, falling back for unknown formats.
    pub fn extension(&self) -> &'static str {
        extension_for(&self.format)
    }
}

/// Trim, collapse inner whitespace, lower-case.
pub fn normalize_text(text: &str) -> String {
    collapse_whitespace(text).to_lowercase()
}

pub(crate) fn collapse_whitespace(text: &str) -> String {
    WHITESPACE.replace_all(text.trim(), " ").into_owned()
}

fn or_default(value: Option<&str>, default: &str) -> String {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => default.to_string(),
    }
}

fn finite_or(value: Option<f32>, default: f32) -> f32 {
    value.filter(|v| v.is_finite()).unwrap_or(default)
}

/// Shortest round-trip rendering. `-0.0` and `0.0` compare equal, so they render alike.
fn canonical_float(value: f32) -> String {
    if value == 0.0 {
        "0".to_string()
    } else {
        value.to_string()
    }
}

/// Supported payload encodings. Each maps 1:1 to an archive file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudioFormat {
    Mp3,
    Wav,
    Ogg,
    Opus,
    Webm,
    Aac,
    Flac,
    Pcm,
}

impl AudioFormat {
    pub const ALL: [AudioFormat; 8] = [
        AudioFormat::Mp3,
        AudioFormat::Wav,
        AudioFormat::Ogg,
        AudioFormat::Opus,
        AudioFormat::Webm,
        AudioFormat::Aac,
        AudioFormat::Flac,
        AudioFormat::Pcm,
    ];

    /// Parse a provider-declared format name or MIME type.
    pub fn from_declared(format: &str) -> Option<Self> {
        let format = format.trim().to_ascii_lowercase();
        let name = format.strip_prefix("audio/").unwrap_or(&format);
        match name {
            "mp3" | "mpeg" | "mpga" => Some(AudioFormat::Mp3),
            "wav" | "wave" | "x-wav" => Some(AudioFormat::Wav),
            "ogg" | "ogg_vorbis" | "vorbis" => Some(AudioFormat::Ogg),
            "opus" | "ogg_opus" => Some(AudioFormat::Opus),
            "webm" => Some(AudioFormat::Webm),
            "aac" => Some(AudioFormat::Aac),
            "flac" | "x-flac" => Some(AudioFormat::Flac),
            "pcm" | "linear16" | "l16" => Some(AudioFormat::Pcm),
            _ => None,
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.extension() == ext)
    }

    pub fn extension(self) -> &'static str {
        match self {
            AudioFormat::Mp3 => ".mp3",
            AudioFormat::Wav => ".wav",
            AudioFormat::Ogg => ".ogg",
            AudioFormat::Opus => ".opus",
            AudioFormat::Webm => ".webm",
            AudioFormat::Aac => ".aac",
            AudioFormat::Flac => ".flac",
            AudioFormat::Pcm => ".pcm",
        }
    }
}

/// Extension for a declared format string; unknown formats get [`FALLBACK_EXTENSION`].
pub fn extension_for(format: &str) -> &'static str {
    AudioFormat::from_declared(format)
        .map(AudioFormat::extension)
        .unwrap_or(FALLBACK_EXTENSION)
}
