//! Character-set length rules

use procgate_common::config::CharsetSettings;

/// Canonical form used for comparisons: `utf-8`, `UTF8` and `utf_8` are equal
fn canonical(charset: &str) -> String {
    charset
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Whether every character of `charset` is exactly one byte
pub fn is_single_byte(charset: &str, settings: &CharsetSettings) -> bool {
    let wanted = canonical(charset);
    settings
        .single_byte_charsets
        .iter()
        .any(|c| canonical(c) == wanted)
}

/// Whether converting backend text to the client charset keeps byte lengths
///
/// True when no conversion happens, or when both sides are single-byte.
pub fn length_preserving(settings: &CharsetSettings) -> bool {
    canonical(&settings.backend_charset) == canonical(&settings.client_charset)
        || (is_single_byte(&settings.backend_charset, settings)
            && is_single_byte(&settings.client_charset, settings))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn charsets(backend: &str, client: &str) -> CharsetSettings {
        CharsetSettings {
            backend_charset: backend.into(),
            client_charset: client.into(),
            ..CharsetSettings::default()
        }
    }

    #[test]
    fn test_same_charset_preserves_length() {
        assert!(length_preserving(&charsets("UTF-8", "utf8")));
        assert!(length_preserving(&CharsetSettings::default()));
    }

    #[test]
    fn test_single_byte_pairs() {
        assert!(length_preserving(&charsets("ISO-8859-1", "windows-1252")));
        assert!(!length_preserving(&charsets("ISO-8859-1", "UTF-8")));
        assert!(!length_preserving(&charsets("UTF-8", "UTF-16")));
    }

    #[test]
    fn test_single_byte_table_is_configurable() {
        let mut settings = charsets("KOI8-R", "ISO-8859-5");
        assert!(!length_preserving(&settings));
        settings.single_byte_charsets.push("koi8-r".into());
        settings.single_byte_charsets.push("ISO_8859_5".into());
        assert!(length_preserving(&settings));
    }
}
