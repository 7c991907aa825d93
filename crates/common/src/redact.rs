//! Credential masking for logs and operator responses
//!
//! Applied at the logging boundary only — the masked form is never fed
//! back into a request. At most the last 10 characters of a credential
//! are revealed.

/// Number of trailing characters left visible in a masked credential.
const VISIBLE_SUFFIX: usize = 10;

/// Well-known key prefixes kept in the masked form so operators can
/// tell credential families apart at a glance.
const KNOWN_PREFIXES: &[&str] = &["sk-ant-", "sk-"];

/// Mask a credential for display: `sk-ant-REDACTED`
/// becomes `sk-ant-...XXXXXXXXXX`.
///
/// Values too short to safely reveal a suffix are fully redacted.
pub fn mask_credential(value: &str) -> String {
    if value.len() <= VISIBLE_SUFFIX {
        return "***".to_string();
    }

    let prefix = KNOWN_PREFIXES
        .iter()
        .find(|p| value.starts_with(**p) && value.len() > p.len() + VISIBLE_SUFFIX)
        .copied()
        .unwrap_or("");

    // Char boundary safety: credentials are ASCII in practice, but a
    // non-ASCII value must not panic the logging path.
    let suffix_start = value
        .char_indices()
        .rev()
        .nth(VISIBLE_SUFFIX - 1)
        .map(|(i, _)| i)
        .unwrap_or(0);

    format!("{prefix}...{}", &value[suffix_start..])
}
