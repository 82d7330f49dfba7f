//! Naming rules for compartments and stratifications.
//!
//! Stratified compartment names are rendered as
//! `{base}X{stratification}_{stratum}` for every applied stratification, so
//! `X` and `_` cannot appear in stratification names, and base compartment
//! names are restricted to lower-case identifiers.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::ValidationError;

/// Separator placed before every stratification suffix.
pub const STRATUM_SEPARATOR: char = 'X';

/// Separator between a stratification name and its stratum.
pub const STRATUM_VALUE_SEPARATOR: char = '_';

/// Suffix on a stratum key in an adjustment request marking an overwrite.
pub const OVERWRITE_MARKER: char = 'W';

/// Reserved stratification name with global application and ageing flows.
pub const AGE_STRATIFICATION: &str = "age";

const RESERVED: [char; 3] = [STRATUM_SEPARATOR, OVERWRITE_MARKER, STRATUM_VALUE_SEPARATOR];

static COMPARTMENT_NAME: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
static STRATIFICATION_NAME: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
static STRATUM_NAME: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();

fn cached_pattern(
    cell: &'static OnceLock<Result<Regex, regex::Error>>,
    pattern: &str,
    name: &str,
) -> Result<&'static Regex, ValidationError> {
    cell.get_or_init(|| Regex::new(pattern))
        .as_ref()
        .map_err(|e| ValidationError::InvalidName {
            name: name.to_string(),
            reason: format!("name pattern failed to compile: {e}"),
        })
}

/// Validates an unstratified compartment name.
pub fn validate_compartment_name(name: &str) -> Result<(), ValidationError> {
    if cached_pattern(&COMPARTMENT_NAME, r"^[a-z][a-z0-9_]*$", name)?.is_match(name) {
        return Ok(());
    }
    Err(ValidationError::InvalidName {
        name: name.to_string(),
        reason: "compartment names must be lower-case identifiers".to_string(),
    })
}

/// Validates a stratification name.
///
/// Reserved characters are reported before the general shape check so the
/// caller learns which character collides with the naming scheme.
pub fn validate_stratification_name(name: &str) -> Result<(), ValidationError> {
    if let Some(character) = name.chars().find(|c| RESERVED.contains(c)) {
        return Err(ValidationError::ReservedCharacterInName {
            name: name.to_string(),
            character,
        });
    }
    if cached_pattern(&STRATIFICATION_NAME, r"^[a-z0-9]+$", name)?.is_match(name) {
        return Ok(());
    }
    Err(ValidationError::InvalidName {
        name: name.to_string(),
        reason: "stratification names must be non-empty lower-case alphanumerics".to_string(),
    })
}

/// Validates one stratum name.
///
/// Strata may be labels or numbers (`high`, `15`, `2.5`) but cannot contain
/// either separator, so every rendered compartment name still splits back
/// into its suffixes.
pub fn validate_stratum_name(name: &str) -> Result<(), ValidationError> {
    if let Some(character) = name
        .chars()
        .find(|c| [STRATUM_SEPARATOR, STRATUM_VALUE_SEPARATOR].contains(c))
    {
        return Err(ValidationError::ReservedCharacterInName {
            name: name.to_string(),
            character,
        });
    }
    if cached_pattern(&STRATUM_NAME, r"^[A-Za-z0-9.\-]+$", name)?.is_match(name) {
        return Ok(());
    }
    Err(ValidationError::InvalidName {
        name: name.to_string(),
        reason: "stratum names must be letters, digits, '.' or '-'".to_string(),
    })
}

/// Renders the suffix one stratification adds to a compartment name.
#[must_use]
pub fn stratum_suffix(stratification: &str, stratum: &str) -> String {
    format!("{STRATUM_SEPARATOR}{stratification}{STRATUM_VALUE_SEPARATOR}{stratum}")
}

/// Splits a stratum key from an adjustment request into the stratum name and
/// whether it was marked as an overwrite.
#[must_use]
pub fn split_overwrite_marker(key: &str) -> (&str, bool) {
    match key.strip_suffix(OVERWRITE_MARKER) {
        Some(stripped) if !stripped.is_empty() => (stripped, true),
        _ => (key, false),
    }
}
