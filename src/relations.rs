//! Dependency Record: a parsed Debian relation field plus the reduction
//! algorithms that turn a source package's `Build-Depends`-style fields
//! into the concrete, host-specific dependency list that gets handed to
//! the dependency resolver.
//!
//! Generalizes `DebianDependency` (dependency parsing/querying) with the
//! architecture/build-profile/multiarch/alternative-group reductions
//! described by the ephemeral repo builder and build pipeline.

use debian_control::lossless::relations::{Relation, Relations};
use debian_control::relations::VersionConstraint;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::hash::Hash;

/// A parsed Debian dependency relation field (e.g. a `Build-Depends` line).
#[derive(Debug)]
pub struct DependencyRecord(Relations);

impl Clone for DependencyRecord {
    fn clone(&self) -> Self {
        DependencyRecord(self.0.to_string().parse().unwrap())
    }
}

impl PartialEq for DependencyRecord {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_string() == other.0.to_string()
    }
}

impl Eq for DependencyRecord {}

impl Hash for DependencyRecord {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.to_string().hash(state);
    }
}

impl Serialize for DependencyRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.to_string().serialize(serializer)
    }
}

impl<'a> Deserialize<'a> for DependencyRecord {
    fn deserialize<D: Deserializer<'a>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid relation field: {}", s)))
    }
}

impl std::str::FromStr for DependencyRecord {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<Relations>()
            .map(DependencyRecord)
            .map_err(|e| format!("{:?}", e))
    }
}

impl std::fmt::Display for DependencyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<DependencyRecord> for Relations {
    fn from(dep: DependencyRecord) -> Self {
        dep.0
    }
}

impl From<Relations> for DependencyRecord {
    fn from(rel: Relations) -> Self {
        DependencyRecord(rel)
    }
}

impl DependencyRecord {
    /// Parse a relation field, panicking on malformed input (for call
    /// sites that construct a record from a literal/known-valid string).
    pub fn new(field: &str) -> Self {
        field
            .parse()
            .unwrap_or_else(|e| panic!("failed to parse relation field {:?}: {}", field, e))
    }

    /// The names of every package mentioned anywhere in the field.
    pub fn package_names(&self) -> HashSet<String> {
        let mut names = HashSet::new();
        for entry in self.0.entries() {
            for relation in entry.relations() {
                names.insert(relation.name());
            }
        }
        names
    }

    /// Whether the field mentions the given package at all.
    pub fn touches_package(&self, package: &str) -> bool {
        self.package_names().iter().any(|n| n == package)
    }

    /// Whether every entry in the field is satisfied by the given
    /// installed package versions.
    pub fn satisfied_by(&self, versions: &std::collections::HashMap<String, debversion::Version>) -> bool {
        let relation_satisfied = |relation: Relation| -> bool {
            let name = relation.name();
            let version = match versions.get(&name) {
                Some(v) => v,
                None => return false,
            };
            match relation.version() {
                Some((VersionConstraint::Equal, v)) => version.cmp(&v) == std::cmp::Ordering::Equal,
                Some((VersionConstraint::GreaterThanEqual, v)) => version >= &v,
                Some((VersionConstraint::GreaterThan, v)) => version > &v,
                Some((VersionConstraint::LessThanEqual, v)) => version <= &v,
                Some((VersionConstraint::LessThan, v)) => version < &v,
                None => true,
            }
        };
        self.0.entries().all(|entry| entry.relations().any(relation_satisfied))
    }

    /// Apply every host-specific reduction (architecture, build-profile,
    /// `:native` qualifier rewrite, alternative-group collapse) in the
    /// order the ephemeral repo builder needs them: qualifiers are
    /// resolved before alternatives are collapsed, since a qualifier can
    /// eliminate an alternative outright.
    pub fn reduce_for_build(
        &self,
        host_arch: &str,
        build_arch: &str,
        active_profiles: &[String],
    ) -> DependencyRecord {
        let raw = self.0.to_string();
        let entries = split_top_level(&raw, ',');
        let mut kept_entries = Vec::new();

        for entry in entries {
            let alternatives = split_top_level(&entry, '|');
            let mut kept_alternatives = Vec::new();
            for alt in alternatives {
                let (name_and_version, arches, profiles) = parse_qualifiers(&alt);
                if !arch_matches(&arches, host_arch) {
                    continue;
                }
                if !profiles_match(&profiles, active_profiles) {
                    continue;
                }
                let rewritten = rewrite_native(&name_and_version, build_arch);
                kept_alternatives.push(rewritten);
            }
            if kept_alternatives.is_empty() {
                continue;
            }
            // Alternative-group reduction: keep the first alternative,
            // unless a later alternative names the SAME package with a
            // different version range (in which case both are kept, since
            // collapsing would silently narrow the constraint).
            kept_entries.push(collapse_alternatives(kept_alternatives));
        }

        let reduced = kept_entries.join(", ");
        reduced.parse().unwrap_or_else(|_| DependencyRecord(Relations::default()))
    }
}

/// Split `s` on `sep` at the top level only, i.e. not inside `[...]`,
/// `<...>`, or `(...)`.
fn split_top_level(s: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    for c in s.chars() {
        match c {
            '[' | '<' | '(' => {
                depth += 1;
                current.push(c);
            }
            ']' | '>' | ')' => {
                depth -= 1;
                current.push(c);
            }
            c if c == sep && depth == 0 => {
                parts.push(current.trim().to_string());
                current = String::new();
            }
            c => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

/// Pull the `[arch ...]` and `<profile ...>` qualifiers off a single
/// relation, returning the bare `name (constraint version)` plus the raw
/// qualifier bodies.
fn parse_qualifiers(alt: &str) -> (String, Option<String>, Option<String>) {
    let arch_re = lazy_regex::regex!(r"\[([^\]]*)\]");
    let profile_re = lazy_regex::regex!(r"<([^>]*)>");

    let arches = arch_re.captures(alt).map(|c| c[1].to_string());
    let profiles = profile_re.captures(alt).map(|c| c[1].to_string());

    let mut bare = arch_re.replace(alt, "").to_string();
    bare = profile_re.replace(&bare, "").trim().to_string();

    (bare, arches, profiles)
}

/// Architecture-restriction matching, per Debian policy / bug #816473:
/// a list of bare architecture names is an OR (match if any is equal to
/// `host_arch`, or if `host_arch` itself is `any`); a list of `!`-negated
/// names is an AND (match unless `host_arch` is one of them). Mixed
/// positive/negative lists are invalid per policy; this treats them as an
/// AND over the negative entries and ignores the positive ones, which is
/// the conservative (keeps more, never silently drops a real dependency)
/// reading.
pub(crate) fn arch_matches(arches: &Option<String>, host_arch: &str) -> bool {
    let arches = match arches {
        Some(a) => a,
        None => return true,
    };
    let terms: Vec<&str> = arches.split_whitespace().collect();
    if terms.is_empty() {
        return true;
    }
    let negated: Vec<&str> = terms.iter().filter(|t| t.starts_with('!')).cloned().collect();
    let positive: Vec<&str> = terms.iter().filter(|t| !t.starts_with('!')).cloned().collect();

    if !negated.is_empty() {
        return negated.iter().all(|t| &t[1..] != host_arch);
    }
    positive.iter().any(|&t| t == host_arch || t == "any")
}

/// Whether a source package declaring `Architecture: architecture_field`
/// may be built for `host_arch`: `all` always matches (arch-indep
/// packages build anywhere), otherwise this is the same wildcard
/// OR/AND matching [`arch_matches`] applies to a `[arch...]` restriction
/// list, since `Architecture:` is itself a space-separated wildcard list
/// (`any`, `all`, `linux-any`, `!i386`, ...).
pub fn source_architecture_matches(architecture_field: &str, host_arch: &str) -> bool {
    let terms: Vec<&str> = architecture_field.split_whitespace().collect();
    if terms.iter().any(|&t| t == "all") {
        return true;
    }
    arch_matches(&Some(architecture_field.to_string()), host_arch)
}

/// Build-profile matching: a profile list restricts a relation to builds
/// where ALL its un-negated terms are active and NONE of its negated terms
/// are active.
fn profiles_match(profiles: &Option<String>, active_profiles: &[String]) -> bool {
    let profiles = match profiles {
        Some(p) => p,
        None => return true,
    };
    for group in profiles.split(',') {
        let terms: Vec<&str> = group.split_whitespace().collect();
        let ok = terms.iter().all(|t| {
            if let Some(negated) = t.strip_prefix('!') {
                !active_profiles.iter().any(|p| p == negated)
            } else {
                active_profiles.iter().any(|p| p == t)
            }
        });
        if ok {
            return true;
        }
    }
    false
}

/// Rewrite a `pkg:native` multiarch qualifier to the concrete build
/// architecture package name (`pkg:amd64`), the way dpkg-buildpackage
/// resolves `:native` before invoking apt.
fn rewrite_native(name_and_version: &str, build_arch: &str) -> String {
    name_and_version.replace(":native", &format!(":{}", build_arch))
}

/// Collapse an OR-group of alternatives down to the first, unless two
/// alternatives name the same package with differing version
/// constraints, in which case both survive (narrowing silently would be
/// wrong; policy treats that as a distinct constraint, not a true
/// alternative).
fn collapse_alternatives(alternatives: Vec<String>) -> String {
    if alternatives.len() <= 1 {
        return alternatives.into_iter().next().unwrap_or_default();
    }
    let first_name = package_name_of(&alternatives[0]);
    let mut kept = vec![alternatives[0].clone()];
    for alt in &alternatives[1..] {
        if package_name_of(alt) == first_name {
            kept.push(alt.clone());
        }
    }
    kept.join(" | ")
}

fn package_name_of(relation: &str) -> String {
    relation
        .split(['(', '[', '<'])
        .next()
        .unwrap_or(relation)
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_package_names() {
        let dep = DependencyRecord::new("libssl-dev");
        assert_eq!(dep.package_names(), HashSet::from(["libssl-dev".to_string()]));
    }

    #[test]
    fn test_touches_package() {
        let dep = DependencyRecord::new("libssl-dev");
        assert!(dep.touches_package("libssl-dev"));
        assert!(!dep.touches_package("libssl1.1"));
    }

    #[test]
    fn test_satisfied_by() {
        let dep = DependencyRecord::new("libssl-dev (>= 1.1)");
        let mut versions = std::collections::HashMap::new();
        versions.insert("libssl-dev".to_string(), "1.2".parse().unwrap());
        assert!(dep.satisfied_by(&versions));
    }

    #[test]
    fn test_split_top_level() {
        let parts = split_top_level("foo (>= 1.0) [amd64 arm64], bar | baz", ',');
        assert_eq!(parts, vec!["foo (>= 1.0) [amd64 arm64]", "bar | baz"]);
    }

    #[test]
    fn test_arch_matches_positive_or() {
        let arches = Some("amd64 arm64".to_string());
        assert!(arch_matches(&arches, "amd64"));
        assert!(!arch_matches(&arches, "i386"));
    }

    #[test]
    fn test_arch_matches_negated_and() {
        let arches = Some("!amd64 !arm64".to_string());
        assert!(!arch_matches(&arches, "amd64"));
        assert!(arch_matches(&arches, "i386"));
    }

    #[test]
    fn test_arch_matches_no_restriction() {
        assert!(arch_matches(&None, "amd64"));
    }

    #[test]
    fn test_source_architecture_matches_all() {
        assert!(source_architecture_matches("all", "amd64"));
        assert!(source_architecture_matches("all", "arm64"));
    }

    #[test]
    fn test_source_architecture_matches_any() {
        assert!(source_architecture_matches("any", "amd64"));
    }

    #[test]
    fn test_source_architecture_matches_wildcard_list() {
        assert!(source_architecture_matches("amd64 arm64", "amd64"));
        assert!(!source_architecture_matches("amd64 arm64", "i386"));
    }

    #[test]
    fn test_source_architecture_matches_negated() {
        assert!(source_architecture_matches("!i386", "amd64"));
        assert!(!source_architecture_matches("!i386", "i386"));
    }

    #[test]
    fn test_profiles_match_negated() {
        let profiles = Some("!nocheck".to_string());
        assert!(profiles_match(&profiles, &[]));
        assert!(!profiles_match(&profiles, &["nocheck".to_string()]));
    }

    #[test]
    fn test_rewrite_native() {
        assert_eq!(rewrite_native("libfoo:native (>= 1.0)", "amd64"), "libfoo:amd64 (>= 1.0)");
    }

    #[test]
    fn test_reduce_for_build_drops_nonmatching_arch() {
        let dep = DependencyRecord::new("foo [amd64], bar [!amd64]");
        let reduced = dep.reduce_for_build("amd64", "amd64", &[]);
        assert!(reduced.touches_package("foo"));
        assert!(!reduced.touches_package("bar"));
    }

    #[test]
    fn test_reduce_for_build_collapses_alternatives() {
        let dep = DependencyRecord::new("foo | bar");
        let reduced = dep.reduce_for_build("amd64", "amd64", &[]);
        assert!(reduced.touches_package("foo"));
        assert!(!reduced.touches_package("bar"));
    }

    #[test]
    fn test_reduce_for_build_keeps_profile_filtered_deps() {
        let dep = DependencyRecord::new("foo <!nocheck>, bar <nocheck>");
        let reduced = dep.reduce_for_build("amd64", "amd64", &[]);
        assert!(reduced.touches_package("foo"));
        assert!(!reduced.touches_package("bar"));
    }
}
