//! Hierarchical storage keys and their flat string form.

use std::fmt;

use super::StoreError;

/// Separator between key segments in the flat form.
pub const SEPARATOR: char = '/';

/// An ordered list of segments, e.g. `["doc1", "snapshot", "<hash>"]`.
///
/// Segments are non-empty and never contain [`SEPARATOR`], so
/// `unflatten(flatten(k)) == k` holds for every key. The empty key is the
/// root and is only meaningful as a range prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageKey(Vec<String>);

impl StorageKey {
    pub fn new<I, S>(segments: I) -> Result<Self, StoreError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        for segment in &segments {
            validate_segment(segment)?;
        }
        Ok(Self(segments))
    }

    /// The empty key; as a prefix it matches everything.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Extend this key by one segment.
    pub fn child(&self, segment: impl Into<String>) -> Result<Self, StoreError> {
        let segment = segment.into();
        validate_segment(&segment)?;
        let mut segments = self.0.clone();
        segments.push(segment);
        Ok(Self(segments))
    }

    /// Join segments with the separator.
    pub fn flatten(&self) -> String {
        self.0.join(SEPARATOR.to_string().as_str())
    }

    /// Split a flat key back into segments.
    pub fn unflatten(flat: &str) -> Result<Self, StoreError> {
        if flat.is_empty() {
            return Ok(Self::root());
        }
        Self::new(flat.split(SEPARATOR))
    }

    /// Flat prefix used for listing: the flattened key plus a trailing
    /// separator, so `["doc1"]` never matches `["doc10", ...]`.
    pub fn range_prefix(&self) -> String {
        let mut flat = self.flatten();
        if !flat.is_empty() && !flat.ends_with(SEPARATOR) {
            flat.push(SEPARATOR);
        }
        flat
    }

    /// True when `prefix`'s segments lead this key's segments.
    pub fn starts_with(&self, prefix: &StorageKey) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.flatten())
    }
}

fn validate_segment(segment: &str) -> Result<(), StoreError> {
    if segment.is_empty() {
        return Err(StoreError::InvalidKey("empty segment".into()));
    }
    if segment.contains(SEPARATOR) {
        return Err(StoreError::InvalidKey(format!(
            "segment {segment:?} contains '{SEPARATOR}'"
        )));
    }
    Ok(())
}
