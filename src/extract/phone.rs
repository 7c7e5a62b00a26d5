//! Phone number normalization to E.164

/// Shortest and longest digit counts E.164 allows after the `+`
const MIN_DIGITS: usize = 8;
const MAX_DIGITS: usize = 15;

/// Normalize a raw phone number to `+<digits>`.
///
/// National numbers get `country_code` prepended (dropping one trunk `0`),
/// `00` is read as the international prefix. Returns `None` for anything that
/// does not look like a dialable number: letters, too few or too many
/// digits, or an empty string.
pub fn normalize_e164(raw: &str, country_code: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut digits = String::with_capacity(trimmed.len());
    let mut international = false;
    for (index, c) in trimmed.chars().enumerate() {
        match c {
            '0'..='9' => digits.push(c),
            '+' if index == 0 => international = true,
            ' ' | '-' | '.' | '(' | ')' | '/' => {}
            _ => return None,
        }
    }

    let country_code: String = country_code.chars().filter(char::is_ascii_digit).collect();
    let full = if international {
        digits
    } else if let Some(rest) = digits.strip_prefix("00") {
        rest.to_string()
    } else if let Some(rest) = digits.strip_prefix('0') {
        format!("{}{}", country_code, rest)
    } else if digits.len() > 10 && !country_code.is_empty() && digits.starts_with(&country_code) {
        digits
    } else {
        format!("{}{}", country_code, digits)
    };

    if (MIN_DIGITS..=MAX_DIGITS).contains(&full.len()) {
        Some(format!("+{}", full))
    } else {
        None
    }
}
