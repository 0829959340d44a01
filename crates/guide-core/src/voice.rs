//! ============================================================================
//! Voice Selection - Scoring heuristic over available synthesis voices
//! ============================================================================
//! Picks the best-sounding voice for a language from whatever the speech
//! engine reports:
//! - A per-language user override wins outright
//! - Otherwise candidates of the same base language are scored by exact
//!   locale, quality keywords, Spanish region and remote/local backing
//! - Ties keep the engine's enumeration order
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

const EXACT_LOCALE_BONUS: i32 = 100;
const REMOTE_BONUS: i32 = 50;
const LOCAL_BONUS: i32 = 10;

/// Spanish locales accepted as regional variants
const SPANISH_VARIANTS: &[&str] = &[
    "es-es", "es-mx", "es-us", "es-419", "es-ar", "es-co", "es-cl", "es-pe", "es-ve",
];

/// Regional preference among Spanish voices
const SPANISH_REGION_BONUS: &[(&str, i32)] = &[("es-es", 30), ("es-mx", 20), ("es-us", 10)];

/// A synthesis voice as reported by a speech engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voice {
    pub name: String,
    /// BCP-47 style locale, e.g. "es-ES"
    pub locale: String,
    /// True when synthesis runs on-device; false for network-backed voices
    pub is_local: bool,
}

impl Voice {
    pub fn new(name: impl Into<String>, locale: impl Into<String>, is_local: bool) -> Self {
        Self {
            name: name.into(),
            locale: locale.into(),
            is_local,
        }
    }
}

/// Ordered quality keywords; earlier entries weigh more
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityTable {
    pub tiers: Vec<QualityTier>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityTier {
    /// Case-insensitive substrings matched against the voice name
    pub keywords: Vec<String>,
    pub bonus: i32,
}

impl QualityTier {
    fn new(keywords: &[&str], bonus: i32) -> Self {
        Self {
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            bonus,
        }
    }
}

impl Default for QualityTable {
    fn default() -> Self {
        Self {
            tiers: vec![
                QualityTier::new(&["neural"], 45),
                QualityTier::new(&["wavenet"], 40),
                QualityTier::new(&["premium"], 35),
                QualityTier::new(&["enhanced"], 30),
                QualityTier::new(&["natural"], 25),
                QualityTier::new(&["google", "microsoft", "apple", "samsung", "amazon"], 15),
                QualityTier::new(&["male", "female", "standard"], 5),
            ],
        }
    }
}

impl QualityTable {
    /// Bonus of the highest tier whose keyword appears in the name
    pub fn bonus_for(&self, voice_name: &str) -> i32 {
        let lower = voice_name.to_lowercase();
        self.tiers
            .iter()
            .find(|tier| tier.keywords.iter().any(|k| lower.contains(&k.to_lowercase())))
            .map(|tier| tier.bonus)
            .unwrap_or(0)
    }
}

/// Per-base-language voice name overrides chosen by the user
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VoiceOverrides(pub HashMap<String, String>);

impl VoiceOverrides {
    pub fn get(&self, language: &str) -> Option<&str> {
        self.0.get(&base_language(language)).map(|s| s.as_str())
    }

    pub fn set(&mut self, language: &str, voice_name: impl Into<String>) {
        self.0.insert(base_language(language), voice_name.into());
    }

    pub fn clear(&mut self, language: &str) -> bool {
        self.0.remove(&base_language(language)).is_some()
    }
}

/// Lowercase locale with `_` normalized to `-`
pub fn normalize_locale(locale: &str) -> String {
    locale.trim().replace('_', "-").to_lowercase()
}

/// "es-MX" -> "es"
pub fn base_language(locale: &str) -> String {
    normalize_locale(locale)
        .split('-')
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Default speech locale for an app language code
pub fn speech_locale(language: &str) -> String {
    let locale = match base_language(language).as_str() {
        "en" => "en-US",
        "es" => "es-ES",
        "ko" => "ko-KR",
        "it" => "it-IT",
        "fr" => "fr-FR",
        "de" => "de-DE",
        "ja" => "ja-JP",
        "zh" => "zh-CN",
        "pt" => "pt-PT",
        "ru" => "ru-RU",
        _ => return language.to_string(),
    };
    // Already-qualified codes are kept as given
    if language.contains('-') || language.contains('_') {
        language.replace('_', "-")
    } else {
        locale.to_string()
    }
}

fn is_candidate(voice: &Voice, target_base: &str) -> bool {
    let locale = normalize_locale(&voice.locale);
    if base_language(&locale) == target_base {
        return true;
    }
    target_base == "es" && SPANISH_VARIANTS.contains(&locale.as_str())
}

/// Score a single candidate against the requested locale
pub fn score_voice(voice: &Voice, target_locale: &str, quality: &QualityTable) -> i32 {
    let locale = normalize_locale(&voice.locale);
    let target = normalize_locale(target_locale);

    let mut score = 0;
    if locale == target {
        score += EXACT_LOCALE_BONUS;
    }

    score += quality.bonus_for(&voice.name);

    if base_language(&target) == "es" {
        if let Some((_, bonus)) = SPANISH_REGION_BONUS.iter().find(|(l, _)| *l == locale) {
            score += bonus;
        }
    }

    score += if voice.is_local { LOCAL_BONUS } else { REMOTE_BONUS };
    score
}

/// Pick the best voice for `language`, or `None` when no voice speaks it
pub fn select_voice(
    voices: &[Voice],
    language: &str,
    overrides: &VoiceOverrides,
    quality: &QualityTable,
) -> Option<Voice> {
    let target_locale = speech_locale(language);
    let target_base = base_language(&target_locale);

    if let Some(name) = overrides.get(&target_base) {
        if let Some(voice) = voices.iter().find(|v| v.name == name) {
            debug!("Using override voice '{}' for {}", voice.name, target_base);
            return Some(voice.clone());
        }
        debug!("Override voice '{}' not available, scoring instead", name);
    }

    let mut best: Option<(&Voice, i32)> = None;
    for voice in voices.iter().filter(|v| is_candidate(v, &target_base)) {
        let score = score_voice(voice, &target_locale, quality);
        // Strictly greater keeps the earliest voice on ties
        if best.map(|(_, s)| score > s).unwrap_or(true) {
            best = Some((voice, score));
        }
    }

    if let Some((voice, score)) = best {
        debug!("Selected voice '{}' ({}) score {}", voice.name, voice.locale, score);
    }
    best.map(|(v, _)| v.clone())
}
