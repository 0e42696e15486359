//! Scalar helpers shared by the extractors.

/// Splits `a, b` / newline separated text into trimmed, non-empty items.
pub(crate) fn split_list(raw: &str) -> Vec<String> {
    raw.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split([',', '\n'])
        .map(|s| s.trim().trim_matches(|c| c == '"' || c == '\''))
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Some(true),
        "false" | "no" | "0" | "off" => Some(false),
        _ => None,
    }
}

/// Normalizes a field key: lowercase, `_` folded to `-`.
pub(crate) fn field_key(raw: &str) -> String {
    raw.trim().to_ascii_lowercase().replace('_', "-")
}

/// Temperature must be a number in `0.0..=1.0`.
pub(crate) fn parse_temperature(raw: &str) -> Result<f64, String> {
    let value: f64 = raw
        .trim()
        .parse()
        .map_err(|_| format!("temperature '{}' is not a number", raw.trim()))?;
    if !(0.0..=1.0).contains(&value) {
        return Err(format!("temperature {value} is outside 0.0..=1.0"));
    }
    Ok(value)
}

pub(crate) fn parse_max_tokens(raw: &str) -> Result<u32, String> {
    raw.trim()
        .parse()
        .map_err(|_| format!("max-tokens '{}' is not a positive integer", raw.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_list_handles_commas_brackets_and_quotes() {
        assert_eq!(split_list("bash, read"), vec!["bash", "read"]);
        assert_eq!(split_list("[bash, 'read']"), vec!["bash", "read"]);
        assert_eq!(split_list("bash\n  read\n"), vec!["bash", "read"]);
        assert!(split_list("  ").is_empty());
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert_eq!(parse_bool("Yes"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn temperature_is_range_checked() {
        assert_eq!(parse_temperature("0.3"), Ok(0.3));
        assert!(parse_temperature("1.5").is_err());
        assert!(parse_temperature("warm").is_err());
    }

    #[test]
    fn field_key_normalizes_case_and_underscores() {
        assert_eq!(field_key("System_Prompt"), "system-prompt");
    }
}
