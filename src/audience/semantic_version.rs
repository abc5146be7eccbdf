//! Version comparison for `semver_*` audience conditions.
//!
//! Versions are `major[.minor[.patch]]` with an optional `-prerelease` or `+build` suffix. The
//! comparison is only as precise as the target: `"2.1.5"` matches a target of `"2.1"`.
use std::cmp::Ordering;

use crate::error::EvaluationError;

const PRE_RELEASE_SEPARATOR: char = '-';
const BUILD_SEPARATOR: char = '+';

/// Compare `version` (supplied by the user) against `target` (from the condition).
pub fn compare(version: &str, target: &str) -> Result<Ordering, EvaluationError> {
    let target_parts = split(target)?;
    let version_parts = split(version)?;
    let target_is_pre_release = is_pre_release(target);
    let version_is_pre_release = is_pre_release(version);

    for (idx, target_part) in target_parts.iter().enumerate() {
        let Some(part) = version_parts.get(idx) else {
            // Version ran out of parts while equal so far. A pre-release target sorts below its
            // release, so it is still satisfied.
            return Ok(if target_is_pre_release {
                Ordering::Greater
            } else {
                Ordering::Less
            });
        };

        if !is_number(part) {
            match part.cmp(target_part) {
                Ordering::Less => {
                    return Ok(if target_is_pre_release && !version_is_pre_release {
                        Ordering::Greater
                    } else {
                        Ordering::Less
                    });
                }
                Ordering::Greater => {
                    return Ok(if !target_is_pre_release && version_is_pre_release {
                        Ordering::Less
                    } else {
                        Ordering::Greater
                    });
                }
                Ordering::Equal => {}
            }
        } else if let (Ok(part), Ok(target)) = (part.parse::<u64>(), target_part.parse::<u64>()) {
            match part.cmp(&target) {
                Ordering::Equal => {}
                other => return Ok(other),
            }
        } else {
            return Ok(Ordering::Less);
        }
    }

    if version_is_pre_release && !target_is_pre_release {
        return Ok(Ordering::Less);
    }

    Ok(Ordering::Equal)
}

/// Split a version into its dotted numeric parts, followed by the pre-release/build suffix if
/// any.
fn split(version: &str) -> Result<Vec<&str>, EvaluationError> {
    let invalid = || EvaluationError::InvalidSemanticVersion(version.to_owned());

    if version.chars().any(char::is_whitespace) {
        return Err(invalid());
    }

    let (prefix, suffix) = if is_pre_release(version) || is_build(version) {
        let separator = if is_pre_release(version) {
            PRE_RELEASE_SEPARATOR
        } else {
            BUILD_SEPARATOR
        };
        match version.split_once(separator) {
            Some((prefix, suffix)) if !prefix.is_empty() && !suffix.is_empty() => {
                (prefix, Some(suffix))
            }
            _ => return Err(invalid()),
        }
    } else {
        (version, None)
    };

    if prefix.matches('.').count() > 2 {
        return Err(invalid());
    }

    let mut parts = prefix.split('.').collect::<Vec<_>>();
    if !parts.iter().all(|part| is_number(part)) {
        return Err(invalid());
    }
    parts.extend(suffix);

    Ok(parts)
}

fn is_number(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn is_pre_release(version: &str) -> bool {
    position(version, PRE_RELEASE_SEPARATOR) < position(version, BUILD_SEPARATOR)
}

fn is_build(version: &str) -> bool {
    position(version, BUILD_SEPARATOR) < position(version, PRE_RELEASE_SEPARATOR)
}

fn position(version: &str, c: char) -> usize {
    version.find(c).unwrap_or(usize::MAX)
}
