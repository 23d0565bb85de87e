//! Dirty location set: the `&`-delimited list of object suffixes recorded on
//! the image header while the image is dirty.

use std::fmt;

pub const LOCATION_DELIMITER: char = '&';

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirtyLocations {
    raw: String,
}

impl DirtyLocations {
    pub fn parse(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.raw
            .split(LOCATION_DELIMITER)
            .filter(|loc| !loc.is_empty())
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    pub fn contains(&self, location: &str) -> bool {
        self.iter().any(|loc| loc == location)
    }

    /// Appends `location` unless it is already recorded. Empty locations and
    /// locations containing the delimiter are refused.
    pub fn insert(&mut self, location: &str) -> bool {
        if location.is_empty() || location.contains(LOCATION_DELIMITER) || self.contains(location)
        {
            return false;
        }
        if !self.raw.is_empty() && !self.raw.ends_with(LOCATION_DELIMITER) {
            self.raw.push(LOCATION_DELIMITER);
        }
        self.raw.push_str(location);
        true
    }

    /// Cursor over a snapshot of the current set, owned by the caller.
    pub fn cursor(&self) -> LocationCursor {
        LocationCursor {
            raw: self.raw.clone(),
            pos: 0,
        }
    }
}

impl fmt::Display for DirtyLocations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Position in a location list. Each instance carries its own state, so any
/// number of resets can walk their own lists concurrently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationCursor {
    raw: String,
    pos: usize,
}

impl Iterator for LocationCursor {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        while self.pos < self.raw.len() {
            let rest = &self.raw[self.pos..];
            let (loc, advance) = match rest.find(LOCATION_DELIMITER) {
                Some(end) => (&rest[..end], end + 1),
                None => (rest, rest.len()),
            };
            self.pos += advance;
            if !loc.is_empty() {
                return Some(loc.to_string());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_deduplicates() {
        let mut locs = DirtyLocations::default();
        assert!(locs.insert("A"));
        assert!(locs.insert("B"));
        assert!(!locs.insert("A"));
        assert!(!locs.insert(""));
        assert!(!locs.insert("C&D"));
        assert_eq!(locs.as_str(), "A&B");
        assert_eq!(locs.len(), 2);
    }

    #[test]
    fn test_cursor_visits_each_location_once() {
        let locs = DirtyLocations::parse("A&&B&C&");
        let mut cursor = locs.cursor();
        assert_eq!(cursor.next().as_deref(), Some("A"));
        assert_eq!(cursor.by_ref().collect::<Vec<_>>(), vec!["B", "C"]);
        assert_eq!(cursor.next(), None);
        assert_eq!(locs.cursor().count(), 3);
    }

    #[test]
    fn test_independent_cursors() {
        let locs = DirtyLocations::parse("A&B");
        let mut first = locs.cursor();
        let mut second = locs.cursor();
        assert_eq!(first.next().as_deref(), Some("A"));
        assert_eq!(second.next().as_deref(), Some("A"));
        assert_eq!(first.next().as_deref(), Some("B"));
        assert!(DirtyLocations::default().cursor().next().is_none());
    }
}
