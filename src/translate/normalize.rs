//! Language detection and placeholder protection.
//! HTML tags, shortcodes, URLs, e-mail addresses and inline code are swapped
//! for `<<PHn>>` tags before a unit goes to the model and swapped back after,
//! so markup never depends on the model copying it faithfully.

use std::sync::LazyLock;

use regex::Regex;

use super::TranslateError;

/// A placeholder substitution that must be restored after translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderEntry {
    pub tag: String,      // e.g. "<<PH0>>"
    pub original: String, // e.g. "<a href=\"https://example.com\">"
}

/// Text ready for the model plus what it takes to undo the protection.
#[derive(Debug, Clone)]
pub struct Protected {
    pub text: String,
    pub placeholders: Vec<PlaceholderEntry>,
}

impl Protected {
    /// Put the originals back into `translated`.
    /// Every placeholder must survive translation; a missing or invented tag
    /// means the model mangled structure and the output is rejected.
    pub fn restore(&self, translated: &str) -> Result<String, TranslateError> {
        let missing: Vec<&str> = self
            .placeholders
            .iter()
            .filter(|e| !translated.contains(&e.tag))
            .map(|e| e.tag.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(TranslateError::MalformedOutput(format!(
                "placeholders dropped: {}",
                missing.join(", ")
            )));
        }

        let restored = PLACEHOLDER.replace_all(translated, |caps: &regex::Captures<'_>| {
            caps[1]
                .parse::<usize>()
                .ok()
                .and_then(|i| self.placeholders.get(i))
                .map(|e| e.original.clone())
                .unwrap_or_else(|| caps[0].to_string())
        });
        if PLACEHOLDER.is_match(&restored) {
            return Err(TranslateError::MalformedOutput(
                "unknown placeholder in output".into(),
            ));
        }
        Ok(restored.into_owned())
    }
}

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<<PH(\d+)>>").expect("placeholder pattern"));

static PROTECTED_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        // HTML tags and comments
        r"<!--.*?-->|</?[a-zA-Z][^<>]*>",
        // Shortcodes: [gallery ids="1,2"], [/caption]
        r#"|\[/?[a-zA-Z][\w-]*(?:\s[^\[\]]*)?/?\]"#,
        // URLs
        r"|https?://[^\s<>\x22']+",
        // Emails
        r"|[a-zA-Z0-9._%+\-]+@[a-zA-Z0-9.\-]+\.[a-zA-Z]{2,}",
        // Inline code (backtick-wrapped)
        r"|`[^`]+`",
    ))
    .expect("protected token pattern")
});

/// Replace protected tokens with `<<PH0>>`, `<<PH1>>`, ... in order of appearance.
pub fn protect(text: &str) -> Protected {
    let mut placeholders = Vec::new();
    let replaced = PROTECTED_TOKEN.replace_all(text, |caps: &regex::Captures<'_>| {
        let tag = format!("<<PH{}>>", placeholders.len());
        placeholders.push(PlaceholderEntry {
            tag: tag.clone(),
            original: caps[0].to_string(),
        });
        tag
    });
    Protected {
        text: replaced.into_owned(),
        placeholders,
    }
}

/// Detects the dominant language of `text` using whatlang.
/// Markup is stripped first. Returns an ISO 639-1 code or None if detection
/// is unreliable.
pub fn detect_language(text: &str) -> Option<String> {
    let plain = PROTECTED_TOKEN.replace_all(text, " ");
    let info = whatlang::detect(&plain)?;
    if !info.is_reliable() {
        return None;
    }
    lang_to_code(info.lang()).map(str::to_string)
}

fn lang_to_code(lang: whatlang::Lang) -> Option<&'static str> {
    use whatlang::Lang::*;
    let code = match lang {
        Eng => "en",
        Cmn => "zh",
        Jpn => "ja",
        Kor => "ko",
        Fra => "fr",
        Deu => "de",
        Spa => "es",
        Rus => "ru",
        Por => "pt",
        Ita => "it",
        Ara => "ar",
        Hin => "hi",
        Tur => "tr",
        Vie => "vi",
        Tha => "th",
        Nld => "nl",
        Pol => "pl",
        Ukr => "uk",
        Swe => "sv",
        Dan => "da",
        Fin => "fi",
        Ces => "cs",
        Ell => "el",
        Heb => "he",
        _ => return None,
    };
    Some(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protect_tags_urls_shortcodes() {
        let p = protect(
            "<p>See <a href=\"https://x.io/a\">docs</a> [gallery ids=\"1,2\"] or mail me@x.io</p>",
        );
        assert_eq!(
            p.text,
            "<<PH0>>See <<PH1>>docs<<PH2>> <<PH3>> or mail <<PH4>><<PH5>>"
        );
        assert_eq!(p.placeholders[3].original, "[gallery ids=\"1,2\"]");
        assert_eq!(p.placeholders[4].original, "me@x.io");
    }

    #[test]
    fn test_restore_round_trips() {
        let source = "<h2 class=\"x\">Hello <em>there</em></h2> https://a.b/c";
        let p = protect(source);
        assert_eq!(p.restore(&p.text).unwrap(), source);
    }

    #[test]
    fn test_restore_allows_reordering() {
        let p = protect("<b>red</b> <i>car</i>");
        let translated = "<<PH2>>voiture<<PH3>> <<PH0>>rouge<<PH1>>";
        assert_eq!(p.restore(translated).unwrap(), "<i>voiture</i> <b>rouge</b>");
    }

    #[test]
    fn test_restore_rejects_dropped_placeholder() {
        let p = protect("<b>bold</b>");
        let err = p.restore("<<PH0>>gras").unwrap_err();
        assert!(matches!(err, TranslateError::MalformedOutput(_)));
    }

    #[test]
    fn test_restore_rejects_invented_placeholder() {
        let p = protect("<b>bold</b>");
        assert!(p.restore("<<PH0>>gras<<PH1>><<PH7>>").is_err());
    }

    #[test]
    fn test_plain_text_has_no_placeholders() {
        let p = protect("Just words, 42 of them.");
        assert!(p.placeholders.is_empty());
        assert_eq!(p.restore("Juste des mots").unwrap(), "Juste des mots");
    }

    #[test]
    fn test_detect_language_ignores_markup() {
        let text =
            "<p>Le chat est sur la table et le chien dort dans le jardin depuis ce matin.</p>";
        assert_eq!(detect_language(text).as_deref(), Some("fr"));
    }
}
