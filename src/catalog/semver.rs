use std::cmp::Ordering;

use semver::Version;

/// Pre-release channels admitted into the catalog when followed by a build counter.
const ADMITTED_CHANNELS: &[&str] = &["alpha", "beta"];

/// Parse a registry tag into a semver::Version, tolerating the usual tag conventions.
///
/// - Surrounding whitespace and a single leading 'v' are ignored
/// - Leading zeros of the numeric components are dropped
/// - Missing minor and patch components are padded with zeros
///
/// A shortened version carrying pre-release or build metadata (e.g. "1.2-beta")
/// is rejected, since the padding position would be ambiguous.
///
/// Examples:
/// - "v1" -> Version(1, 0, 0)
/// - "1.2" -> Version(1, 2, 0)
/// - "v01.02.3-beta.1" -> Version(1, 2, 3-beta.1)
pub fn parse_tolerant(tag: &str) -> Option<Version> {
    let tag = tag.trim();
    let tag = tag.strip_prefix('v').unwrap_or(tag);

    let mut parts: Vec<String> = tag.splitn(3, '.').map(strip_leading_zeros).collect();

    if parts.len() < 3 {
        if parts
            .last()
            .is_some_and(|last| last.contains(['+', '-']))
        {
            return None;
        }
        parts.resize(3, "0".to_string());
    }

    Version::parse(&parts.join(".")).ok()
}

fn strip_leading_zeros(part: &str) -> String {
    if part.len() <= 1 {
        return part.to_string();
    }

    let trimmed = part.trim_start_matches('0');
    if trimmed.starts_with(|c: char| c.is_ascii_digit()) {
        trimmed.to_string()
    } else {
        format!("0{}", trimmed)
    }
}

/// Returns true if the pre-release part of the version is acceptable for the catalog.
///
/// Final releases are always accepted. Pre-releases are accepted only in the
/// `alpha.N` / `beta.N` shape used by intermediate builds; release candidates and
/// ad-hoc tags are not.
pub fn is_admitted_prerelease(version: &Version) -> bool {
    if version.pre.is_empty() {
        return true;
    }

    let identifiers: Vec<&str> = version.pre.as_str().split('.').collect();
    match identifiers.as_slice() {
        [channel, counter] => {
            ADMITTED_CHANNELS.contains(channel)
                && !counter.is_empty()
                && counter.bytes().all(|b| b.is_ascii_digit())
        }
        _ => false,
    }
}

/// Select the release versions from a list of raw registry tags.
///
/// Tags that do not parse, versions below `min_version` and non-admitted
/// pre-releases are dropped silently. The result is sorted ascending by
/// SemVer precedence and contains each precedence at most once.
pub fn filter_versions<I, S>(tags: I, min_version: &Version) -> Vec<Version>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut versions: Vec<Version> = tags
        .into_iter()
        .filter_map(|tag| parse_tolerant(tag.as_ref()))
        .filter(|version| version.cmp_precedence(min_version) != Ordering::Less)
        .filter(is_admitted_prerelease)
        .collect();

    versions.sort_by(|a, b| a.cmp_precedence(b));
    versions.dedup_by(|a, b| a.cmp_precedence(b) == Ordering::Equal);

    versions
}
