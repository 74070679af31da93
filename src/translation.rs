//! Translation adapter. The original relied on a hard dependency on a commercial
//! translation API; here that becomes a trait so a self-hosted deploy can run with
//! translation disabled (the default) without pulling in a network dependency, while
//! still leaving a seam for a real provider to be plugged in later.
//!
//! Source-language detection is kept separate from the `Translator` trait: it gates
//! whether translation runs at all, so it has to work even with `NoopTranslator`.

use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct TranslationResult {
    pub translated_text: String,
    pub source_language: Option<String>,
    pub target_language: String,
    pub provider: String,
    pub cost_usd: Option<f64>,
}

#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(&self, text: &str, target_lang: &str) -> anyhow::Result<TranslationResult>;
}

/// Default translator: performs no translation. Used when `[translation].enabled`
/// is false, which is the default configuration.
pub struct NoopTranslator;

#[async_trait]
impl Translator for NoopTranslator {
    async fn translate(&self, text: &str, target_lang: &str) -> anyhow::Result<TranslationResult> {
        Ok(TranslationResult {
            translated_text: text.to_string(),
            source_language: None,
            target_language: target_lang.to_string(),
            provider: "noop".to_string(),
            cost_usd: None,
        })
    }
}

/// Detect a message's source language as an ISO 639-1 code, so it can be compared
/// directly against `[translation].target_language`. Returns `None` when whatlang
/// isn't confident enough to call it (short or mixed-script text), matching the
/// "not unknown" gate the translation step checks before ever calling the adapter.
pub fn detect_language(text: &str) -> Option<String> {
    let info = whatlang::detect(text)?;
    if !info.is_reliable() {
        return None;
    }
    Some(iso_639_1(info.lang()))
}

/// whatlang reports ISO 639-3; translation providers and `target_language` config
/// are conventionally ISO 639-1. Falls back to the ISO 639-3 code for languages
/// outside this table rather than guessing, which just means translation runs
/// (treated as "not a confirmed match") instead of being skipped.
fn iso_639_1(lang: whatlang::Lang) -> String {
    use whatlang::Lang::*;
    match lang {
        Eng => "en",
        Rus => "ru",
        Ukr => "uk",
        Deu => "de",
        Fra => "fr",
        Spa => "es",
        Ita => "it",
        Por => "pt",
        Nld => "nl",
        Pol => "pl",
        Tur => "tr",
        Ell => "el",
        Ces => "cs",
        Swe => "sv",
        Dan => "da",
        Fin => "fi",
        Nob => "no",
        Hun => "hu",
        Ron => "ro",
        Bul => "bg",
        Ara => "ar",
        Heb => "he",
        Hin => "hi",
        Jpn => "ja",
        Kor => "ko",
        Cmn => "zh",
        Vie => "vi",
        Tha => "th",
        Ind => "id",
        other => return other.code().to_string(),
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_translator_echoes_input() {
        let t = NoopTranslator;
        let result = t.translate("hello", "uk").await.unwrap();
        assert_eq!(result.translated_text, "hello");
        assert_eq!(result.provider, "noop");
    }

    #[test]
    fn detect_language_recognizes_english() {
        let text = "The quick brown fox jumps over the lazy dog near the riverbank every morning.";
        assert_eq!(detect_language(text).as_deref(), Some("en"));
    }

    #[test]
    fn detect_language_recognizes_russian() {
        let text = "Съешь же ещё этих мягких французских булок, да выпей чаю вечером после работы.";
        assert_eq!(detect_language(text).as_deref(), Some("ru"));
    }

    #[test]
    fn detect_language_returns_none_for_unreliable_input() {
        assert_eq!(detect_language("ok"), None);
    }
}
