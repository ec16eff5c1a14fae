//! System prompts for AI text cleaning.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ClientError;

const OCR_CLEANUP_PROMPT: &str = "You are a text restoration assistant. Clean the following OCR-extracted text:\n\
- Fix OCR errors (e.g. 'rn' misread as 'm', '1' misread as 'l', '0' as 'O')\n\
- Normalize paragraph breaks: remove mid-sentence line breaks, preserve paragraph boundaries\n\
- Remove headers, footers, and page numbers that were captured during extraction\n\
- Fix hyphenation artifacts from line-wrapping (e.g. 're-\\nceive' to 'receive')\n\
- Preserve the original meaning, tone, and structure of the text\n\
Return ONLY the cleaned text. Do not add commentary or explanation.";

const TTS_OPTIMIZATION_PROMPT: &str = "You are a text-to-speech preparation assistant. Rewrite the following text to be spoken aloud naturally:\n\
- Expand abbreviations (e.g. 'Dr.' to 'Doctor', 'St.' to 'Street' or 'Saint' based on context)\n\
- Spell out numbers in a speakable way (e.g. '1,234' to 'one thousand two hundred thirty-four')\n\
- Expand acronyms on first occurrence (e.g. 'NATO' to 'NATO, the North Atlantic Treaty Organization')\n\
- Convert URLs and emails to a spoken description or omit them\n\
- Normalize special characters (e.g. '&' to 'and', '%' to 'percent')\n\
- Preserve the original meaning and paragraph structure\n\
Return ONLY the optimized text. Do not add commentary or explanation.";

const LIGHT_TOUCH_PROMPT: &str = "You are a proofreading assistant. Make minimal corrections to the following text:\n\
- Fix only obvious typos and misspellings\n\
- Fix clearly broken punctuation\n\
- Do NOT change sentence structure, word choice, or style\n\
- Preserve everything else exactly as-is\n\
Return ONLY the corrected text. Do not add commentary or explanation.";

/// Cleaning preset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleaningPreset {
    /// Repair OCR artifacts.
    #[default]
    OcrCleanup,
    /// Rewrite for natural speech.
    TtsOptimization,
    /// Minimal proofreading.
    LightTouch,
    /// User-supplied prompt.
    Custom,
}

impl CleaningPreset {
    pub const ALL: [CleaningPreset; 4] = [
        Self::OcrCleanup,
        Self::TtsOptimization,
        Self::LightTouch,
        Self::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OcrCleanup => "ocr_cleanup",
            Self::TtsOptimization => "tts_optimization",
            Self::LightTouch => "light_touch",
            Self::Custom => "custom",
        }
    }

    /// Built-in prompt. `Custom` has none of its own and uses OCR cleanup.
    pub fn builtin_prompt(&self) -> &'static str {
        match self {
            Self::OcrCleanup | Self::Custom => OCR_CLEANUP_PROMPT,
            Self::TtsOptimization => TTS_OPTIMIZATION_PROMPT,
            Self::LightTouch => LIGHT_TOUCH_PROMPT,
        }
    }
}

impl fmt::Display for CleaningPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CleaningPreset {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|preset| preset.as_str() == s)
            .ok_or_else(|| ClientError::Config(format!("unknown cleaning preset '{}'", s)))
    }
}

/// Preset plus optional custom prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleaningOptions {
    pub preset: CleaningPreset,
    pub custom_prompt: Option<String>,
}

impl CleaningOptions {
    pub fn new(preset: CleaningPreset) -> Self {
        Self {
            preset,
            custom_prompt: None,
        }
    }

    /// Use `prompt` as the system prompt.
    pub fn custom(prompt: impl Into<String>) -> Self {
        Self {
            preset: CleaningPreset::Custom,
            custom_prompt: Some(prompt.into()),
        }
    }

    /// The system prompt to send with every chunk.
    ///
    /// A custom preset with a blank prompt falls back to OCR cleanup.
    pub fn system_prompt(&self) -> &str {
        match (&self.preset, self.custom_prompt.as_deref()) {
            (CleaningPreset::Custom, Some(prompt)) if !prompt.trim().is_empty() => prompt,
            (preset, _) => preset.builtin_prompt(),
        }
    }
}
