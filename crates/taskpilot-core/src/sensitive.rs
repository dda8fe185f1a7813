//! Sensitive-data detection and redaction.
//!
//! Used in two places: the safety governor inspects outbound tool arguments
//! for card numbers, SSNs and secret-bearing fields, and the task log runs
//! every payload through [`redact_value`] before it is written.

use serde_json::Value;

/// Field names whose values are always treated as secrets.
pub const SECRET_KEYS: &[&str] = &[
    "pin",
    "password",
    "passcode",
    "secret",
    "ssn",
    "security_answer",
    "card_number",
];

/// Category of sensitive data found in a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensitiveKind {
    CreditCard,
    Ssn,
    SecretField,
}

impl SensitiveKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensitiveKind::CreditCard => "credit_card",
            SensitiveKind::Ssn => "ssn",
            SensitiveKind::SecretField => "secret_field",
        }
    }
}

/// A single finding, with the JSON path at which it was detected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensitiveFinding {
    pub kind: SensitiveKind,
    pub path: String,
}

/// Return true if the key names a secret-bearing field.
pub fn is_secret_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SECRET_KEYS.iter().any(|k| lower == *k || lower.ends_with(&format!("_{}", k)))
}

/// Scan free text for card numbers and SSNs.
pub fn scan_text(text: &str) -> Vec<SensitiveKind> {
    let mut kinds = Vec::new();
    if redact_credit_cards(text).1 > 0 {
        kinds.push(SensitiveKind::CreditCard);
    }
    if redact_ssns(text).1 > 0 {
        kinds.push(SensitiveKind::Ssn);
    }
    kinds
}

/// Redact card numbers and SSNs in free text, returning the cleaned text and
/// the number of replacements.
pub fn redact_text(text: &str) -> (String, usize) {
    let (text, cards) = redact_credit_cards(text);
    let (text, ssns) = redact_ssns(&text);
    (text, cards + ssns)
}

/// Walk a JSON value and report every sensitive finding.
pub fn find_in_value(value: &Value) -> Vec<SensitiveFinding> {
    let mut findings = Vec::new();
    walk(value, "$", &mut findings);
    findings
}

fn walk(value: &Value, path: &str, findings: &mut Vec<SensitiveFinding>) {
    match value {
        Value::String(s) => {
            for kind in scan_text(s) {
                findings.push(SensitiveFinding {
                    kind,
                    path: path.to_string(),
                });
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                walk(item, &format!("{}[{}]", path, i), findings);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                let child = format!("{}.{}", path, key);
                if is_secret_key(key) && !item.is_null() {
                    findings.push(SensitiveFinding {
                        kind: SensitiveKind::SecretField,
                        path: child,
                    });
                } else {
                    walk(item, &child, findings);
                }
            }
        }
        _ => {}
    }
}

/// Return a copy of `value` with secret fields replaced and card numbers and
/// SSNs redacted inside every string.
pub fn redact_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(redact_text(s).0),
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| {
                    let cleaned = if is_secret_key(key) && !item.is_null() {
                        Value::String("[SECRET_REDACTED]".to_string())
                    } else {
                        redact_value(item)
                    };
                    (key.clone(), cleaned)
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Mask an account number down to its last four characters.
pub fn mask_account(account: &str) -> String {
    let chars: Vec<char> = account.chars().filter(|c| !c.is_whitespace()).collect();
    if chars.len() <= 4 {
        return "*".repeat(chars.len());
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{}", "*".repeat(chars.len() - 4), tail)
}

/// Luhn checksum over 13 to 19 digits.
fn luhn_check(digits: &[u32]) -> bool {
    if digits.len() < 13 || digits.len() > 19 {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

/// Replace Luhn-valid runs of 13 to 19 digits (spaces and dashes allowed
/// between digits) with `[CC_REDACTED]`.
fn redact_credit_cards(text: &str) -> (String, usize) {
    let chars: Vec<char> = text.chars().collect();
    let mut result = String::with_capacity(text.len());
    let mut count = 0;
    let mut i = 0;

    while i < chars.len() {
        if !chars[i].is_ascii_digit() {
            result.push(chars[i]);
            i += 1;
            continue;
        }

        let start = i;
        while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == ' ' || chars[i] == '-')
        {
            i += 1;
        }
        // Trailing separators belong to the surrounding text.
        while i > start && !chars[i - 1].is_ascii_digit() {
            i -= 1;
        }

        let digits: Vec<u32> = chars[start..i].iter().filter_map(|c| c.to_digit(10)).collect();
        if luhn_check(&digits) {
            result.push_str("[CC_REDACTED]");
            count += 1;
        } else {
            result.extend(&chars[start..i]);
        }
    }

    (result, count)
}

/// Replace `XXX-XX-XXXX` patterns with `[SSN_REDACTED]`.
fn redact_ssns(text: &str) -> (String, usize) {
    let chars: Vec<char> = text.chars().collect();
    let mut result = String::with_capacity(text.len());
    let mut count = 0;
    let mut i = 0;

    while i < chars.len() {
        if is_ssn_at(&chars, i) {
            result.push_str("[SSN_REDACTED]");
            count += 1;
            i += 11;
        } else {
            result.push(chars[i]);
            i += 1;
        }
    }

    (result, count)
}

fn is_ssn_at(chars: &[char], pos: usize) -> bool {
    if pos + 11 > chars.len() {
        return false;
    }
    // Must not be the tail of a longer digit run.
    if pos > 0 && chars[pos - 1].is_ascii_digit() {
        return false;
    }
    if pos + 11 < chars.len() && chars[pos + 11].is_ascii_digit() {
        return false;
    }
    let window = &chars[pos..pos + 11];
    window.iter().enumerate().all(|(i, c)| match i {
        3 | 6 => *c == '-',
        _ => c.is_ascii_digit(),
    })
}
