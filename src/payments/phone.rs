//! Phone number canonicalization.
//!
//! Subscribers type numbers as `07XXXXXXXX`, `2547XXXXXXXX`,
//! `+2547XXXXXXXX` or bare local digits; the providers want exactly one
//! form. Canonicalization is a pure function and idempotent.

/// Dialing code the providers operate under.
pub const COUNTRY_CODE: &str = "254";

/// Canonical country-code-prefixed form, e.g. `254722000000`.
///
/// A leading `0` is replaced by the country code, bare local digits get it
/// prepended, and an already-prefixed number is left unchanged. Spaces,
/// dashes and a leading `+` are stripped first.
pub fn normalize(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '+'))
        .collect();

    if let Some(rest) = cleaned.strip_prefix('0') {
        return format!("{COUNTRY_CODE}{rest}");
    }
    if cleaned.starts_with(COUNTRY_CODE) {
        return cleaned;
    }
    format!("{COUNTRY_CODE}{cleaned}")
}

/// Plus-prefixed variant, e.g. `+254722000000`. Impala Pay wants this one.
pub fn normalize_plus(raw: &str) -> String {
    format!("+{}", normalize(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leading_zero_becomes_country_code() {
        assert_eq!(normalize("0722000000"), "254722000000");
    }

    #[test]
    fn prefixed_number_is_unchanged() {
        assert_eq!(normalize("254722000000"), "254722000000");
    }

    #[test]
    fn bare_local_digits_get_prefixed() {
        assert_eq!(normalize("722000000"), "254722000000");
    }

    #[test]
    fn separators_and_plus_are_stripped() {
        assert_eq!(normalize("+254 722-000-000"), "254722000000");
        assert_eq!(normalize("0722 000 000"), "254722000000");
    }

    #[test]
    fn local_and_prefixed_forms_converge() {
        assert_eq!(normalize("0722000000"), normalize("254722000000"));
        assert_eq!(normalize("0722000000"), normalize("+254722000000"));
        assert_eq!(normalize("0722000000"), normalize("722000000"));
    }

    #[test]
    fn normalization_is_idempotent() {
        for input in [
            "0722000000",
            "722000000",
            "254722000000",
            "+254722000000",
            "0110-123-456",
            "254 110 123 456",
        ] {
            let once = normalize(input);
            assert_eq!(normalize(&once), once, "not idempotent for {input}");
        }
    }

    #[test]
    fn plus_variant_carries_prefix() {
        assert_eq!(normalize_plus("0722000000"), "+254722000000");
        assert_eq!(normalize_plus("+254722000000"), "+254722000000");
    }
}
