//! 基于 whatlang 的语言检测

use crate::clients::{Detection, LanguageDetector};

/// 文本过短时检测结果不可靠
const MIN_TEXT_CHARS: usize = 20;

#[derive(Debug, Default, Clone, Copy)]
pub struct WhatlangDetector;

impl WhatlangDetector {
    pub fn new() -> Self {
        Self
    }
}

impl LanguageDetector for WhatlangDetector {
    fn detect(&self, text: &str) -> Detection {
        if text.chars().filter(|c| c.is_alphabetic()).count() < MIN_TEXT_CHARS {
            return Detection::undetermined();
        }
        match whatlang::detect(text) {
            Some(info) => Detection::single(info.lang().code(), info.confidence()),
            None => Detection::undetermined(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_russian_and_english() {
        let detector = WhatlangDetector::new();

        let russian = detector.detect(
            "Это руководство описывает, как установить и настроить приложение на вашем компьютере.",
        );
        assert_eq!(russian.language, "rus");
        assert!(russian.confidence() > 0.5);

        let english = detector.detect(
            "This guide describes how to install and configure the application on your computer.",
        );
        assert_eq!(english.language, "eng");
    }

    #[test]
    fn test_short_text_is_undetermined() {
        let detection = WhatlangDetector::new().detect("ok");
        assert_eq!(detection.language, "und");
        assert_eq!(detection.confidence(), 0.0);
    }
}
