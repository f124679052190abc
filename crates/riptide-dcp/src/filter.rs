//! Vbucket filter: the per-channel predicate over partition ids.

use std::collections::BTreeSet;
use std::fmt;

use riptide_types::Vbid;

/// A predicate over vbucket ids.
///
/// An **empty filter admits every vbucket**; a non-empty filter admits
/// exactly the ids it contains. This is the convention every caller in the
/// replication layer relies on, so a producer created without an explicit
/// vbucket list streams the whole keyspace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VBucketFilter {
    acceptable: BTreeSet<Vbid>,
}

impl VBucketFilter {
    /// The admit-everything filter.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// A filter admitting exactly the given vbuckets.
    #[must_use]
    pub fn from_vbuckets(vbuckets: impl IntoIterator<Item = Vbid>) -> Self {
        Self {
            acceptable: vbuckets.into_iter().collect(),
        }
    }

    /// Replace the filter's contents.
    pub fn assign(&mut self, vbuckets: impl IntoIterator<Item = Vbid>) {
        self.acceptable = vbuckets.into_iter().collect();
    }

    /// Whether `vb` passes the filter.
    #[inline]
    #[must_use]
    pub fn admits(&self, vb: Vbid) -> bool {
        self.acceptable.is_empty() || self.acceptable.contains(&vb)
    }

    /// Whether this is the admit-everything filter.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.acceptable.is_empty()
    }

    /// Number of explicitly listed vbuckets.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.acceptable.len()
    }

    /// Iterate the explicitly listed vbuckets in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = Vbid> + '_ {
        self.acceptable.iter().copied()
    }
}

impl fmt::Display for VBucketFilter {
    /// Diagnostic rendering: `{ empty }` for admit-all, else `{ 7, 9, 11 }`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.acceptable.is_empty() {
            return f.write_str("{ empty }");
        }
        f.write_str("{ ")?;
        for (i, vb) in self.acceptable.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", vb.get())?;
        }
        f.write_str(" }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vb(id: u16) -> Vbid {
        Vbid::new(id)
    }

    #[test]
    fn empty_filter_admits_all() {
        let filter = VBucketFilter::all();
        assert!(filter.admits(vb(0)));
        assert!(filter.admits(vb(1023)));
        assert!(filter.is_empty());
    }

    #[test]
    fn explicit_filter_admits_members_only() {
        let filter = VBucketFilter::from_vbuckets([vb(7), vb(9)]);
        assert!(filter.admits(vb(7)));
        assert!(filter.admits(vb(9)));
        assert!(!filter.admits(vb(8)));
        assert_eq!(filter.len(), 2);
    }

    #[test]
    fn assign_replaces_contents() {
        let mut filter = VBucketFilter::from_vbuckets([vb(1)]);
        filter.assign([vb(2), vb(3)]);
        assert!(!filter.admits(vb(1)));
        assert!(filter.admits(vb(2)));
    }

    #[test]
    fn render_is_sorted_and_braced() {
        let filter = VBucketFilter::from_vbuckets([vb(11), vb(7), vb(9)]);
        assert_eq!(filter.to_string(), "{ 7, 9, 11 }");
        assert_eq!(VBucketFilter::all().to_string(), "{ empty }");
    }
}
