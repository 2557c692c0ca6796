use crate::prelude::*;
use derivative::Derivative;
use std::fmt::{self, Display};

// Store keys are hierarchical paths, "/Windows/Dialogs/Config" style. A path
// either names an object (a terminal key) or a scope, which is just the
// implied container of everything below it. Scopes are never stored; they
// exist because deeper keys exist.
//
// By default comparison is case-insensitive, which is what you want for
// config-style keys typed by humans. A store can be opened case-sensitive
// instead, in which case the caller is responsible for being consistent
// about key case; we do not dedupe for them.
//
// We keep two renditions of each path: the canonical form of what the
// caller gave us (for display and for the on-disk key image), and the
// folded form that equality and hashing go through. Only the folded form
// participates in Eq/Hash, so a lookup with "/a/b" finds "/A/B" in an
// insensitive store.

pub const MAX_SEGMENT_BYTES: usize = 255;
pub const MAX_PATH_BYTES: usize = 1024;

/// How keys compare, fixed per store at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseMode {
    Insensitive,
    Sensitive,
}

impl CaseMode {
    /// The folding used for key comparison. In a case-sensitive store this
    /// is the identity; callers who want to enforce their own consistency
    /// can run their keys through it before use.
    pub fn fold(&self, s: &str) -> String {
        match self {
            CaseMode::Insensitive => s.to_lowercase(),
            CaseMode::Sensitive => s.to_owned(),
        }
    }
}

/// A validated store path. Equality and hashing use the case-folded form;
/// the form the caller gave us is kept for display and persistence.
#[derive(Debug, Clone, Derivative)]
#[derivative(PartialEq, Eq, Hash)]
pub struct StorePath {
    #[derivative(PartialEq = "ignore", Hash = "ignore")]
    as_given: String,
    normalized: String,
}

fn check_segment(seg: &str, full: &str) -> Result<()> {
    let invalid = |reason: &'static str| StoreError::InvalidPath {
        path: full.to_owned(),
        reason,
    };
    if seg.is_empty() {
        return Err(invalid("empty path segment"));
    }
    if seg.len() > MAX_SEGMENT_BYTES {
        return Err(invalid("segment exceeds the maximum length"));
    }
    if seg.chars().any(|c| c.is_control()) {
        return Err(invalid("control character in segment"));
    }
    Ok(())
}

/// Validates a bare segment name, as used by the find-by-name queries.
pub(crate) fn check_leaf_name(name: &str) -> Result<()> {
    if name.contains('/') {
        return Err(StoreError::InvalidPath {
            path: name.to_owned(),
            reason: "a name must be a single segment",
        });
    }
    check_segment(name, name)
}

impl StorePath {
    /// Parses a terminal key: `/seg/seg/name`, at least one segment, no
    /// trailing slash.
    pub fn parse_key(raw: &str, case: CaseMode) -> Result<StorePath> {
        let path = Self::parse(raw, case, false)?;
        if path.is_root() {
            return Err(StoreError::InvalidPath {
                path: raw.to_owned(),
                reason: "a key needs at least one segment",
            });
        }
        Ok(path)
    }

    /// Parses a scope path. `/` names the root scope, and one trailing
    /// slash is tolerated and stripped.
    pub fn parse_scope(raw: &str, case: CaseMode) -> Result<StorePath> {
        Self::parse(raw, case, true)
    }

    fn parse(raw: &str, case: CaseMode, scope: bool) -> Result<StorePath> {
        let invalid = |reason: &'static str| StoreError::InvalidPath {
            path: raw.to_owned(),
            reason,
        };
        if raw.len() > MAX_PATH_BYTES {
            return Err(invalid("path exceeds the maximum length"));
        }
        let Some(rest) = raw.strip_prefix('/') else {
            return Err(invalid("a path must start with '/'"));
        };
        let rest = if scope && rest.ends_with('/') {
            // "/a/b/" is accepted as a scope; "//" is not a root spelling
            let trimmed = &rest[..rest.len() - 1];
            if trimmed.is_empty() {
                return Err(invalid("empty path segment"));
            }
            trimmed
        } else {
            rest
        };
        let mut segments = Vec::new();
        if !rest.is_empty() {
            for seg in rest.split('/') {
                check_segment(seg, raw)?;
                segments.push(seg);
            }
        }
        let as_given = format!("/{}", segments.join("/"));
        let normalized = case.fold(&as_given);
        Ok(StorePath {
            as_given,
            normalized,
        })
    }

    /// Rebuilds a path from its persisted key image. Same validation as
    /// `parse_key`; the folding is recomputed under the store's case mode.
    pub(crate) fn from_stored(bytes: &[u8], case: CaseMode) -> Result<StorePath> {
        let raw = std::str::from_utf8(bytes).map_err(|_| StoreError::InvalidPath {
            path: String::from_utf8_lossy(bytes).into_owned(),
            reason: "stored key is not valid UTF-8",
        })?;
        Self::parse_key(raw, case)
    }

    pub fn as_str(&self) -> &str {
        &self.as_given
    }

    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    pub fn is_root(&self) -> bool {
        self.normalized == "/"
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.as_given.split('/').skip(1).filter(|s| !s.is_empty())
    }

    fn norm_segments(&self) -> impl Iterator<Item = &str> {
        self.normalized.split('/').skip(1).filter(|s| !s.is_empty())
    }

    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// The final segment, or "" for the root scope.
    pub fn leaf(&self) -> &str {
        self.segments().last().unwrap_or("")
    }

    pub(crate) fn norm_leaf(&self) -> &str {
        self.norm_segments().last().unwrap_or("")
    }

    /// True if `self` lives anywhere below `scope` (any depth).
    pub fn is_under(&self, scope: &StorePath) -> bool {
        let mut mine = self.norm_segments();
        for want in scope.norm_segments() {
            match mine.next() {
                Some(have) if have == want => {}
                _ => return false,
            }
        }
        mine.next().is_some()
    }

    /// True if `scope` is the immediate parent of `self`.
    pub fn is_directly_in(&self, scope: &StorePath) -> bool {
        self.is_under(scope) && self.depth() == scope.depth() + 1
    }

    /// For a path under `scope`, the first segment on the way down, in both
    /// renditions: (as given, folded).
    pub(crate) fn child_toward(&self, scope: &StorePath) -> Option<(&str, &str)> {
        if !self.is_under(scope) {
            return None;
        }
        let idx = scope.depth();
        // is_under guarantees there is a segment at idx in both renditions
        Some((self.segments().nth(idx)?, self.norm_segments().nth(idx)?))
    }
}

impl Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_given)
    }
}
