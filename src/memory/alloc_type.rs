//! Allocation types and request-time preferences.

use std::fmt;
use std::str::FromStr;

/// How a buffer's memory is (or should be) obtained.
///
/// The first five variants are concrete: every [`Buffer`](super::Buffer)
/// carries one of them. `PreferHuge`, `PreferContig` and `Any` only appear
/// in requests and are resolved by the strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationType {
    /// Page-aligned heap memory.
    Anonymous,
    /// Chunks of a huge page segment; fails rather than falling back.
    Huge,
    /// Physically contiguous pages from the driver; fails rather than falling back.
    Contiguous,
    /// The context's external allocator hook.
    External,
    /// The protection domain's custom allocator hook.
    Custom,
    /// Huge pages, falling back to anonymous memory.
    PreferHuge,
    /// Contiguous pages, falling back to anonymous memory.
    PreferContig,
    /// Huge pages, then contiguous pages, then anonymous memory.
    Any,
}

impl AllocationType {
    /// Is this a concrete type rather than a preference?
    #[inline]
    pub fn is_concrete(&self) -> bool {
        !matches!(
            self,
            AllocationType::PreferHuge | AllocationType::PreferContig | AllocationType::Any
        )
    }

    /// Should the huge segment manager be tried for this request?
    #[inline]
    pub fn tries_huge(&self) -> bool {
        matches!(
            self,
            AllocationType::Huge | AllocationType::PreferHuge | AllocationType::Any
        )
    }

    /// Should the contiguous page allocator be tried for this request?
    #[inline]
    pub fn tries_contiguous(&self) -> bool {
        matches!(
            self,
            AllocationType::Contiguous | AllocationType::PreferContig | AllocationType::Any
        )
    }

    /// Name as used in environment overrides.
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationType::Anonymous => "ANON",
            AllocationType::Huge => "HUGE",
            AllocationType::Contiguous => "CONTIG",
            AllocationType::External => "EXTERNAL",
            AllocationType::Custom => "CUSTOM",
            AllocationType::PreferHuge => "PREFER_HUGE",
            AllocationType::PreferContig => "PREFER_CONTIG",
            AllocationType::Any => "ALL",
        }
    }
}

impl fmt::Display for AllocationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing an [`AllocationType`] override.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown allocation type: {0}")]
pub struct ParseAllocationTypeError(String);

impl FromStr for AllocationType {
    type Err = ParseAllocationTypeError;

    /// Parse an override value, case-insensitively.
    ///
    /// Hook-backed types cannot be selected this way: hooks are chosen by
    /// their presence, not by configuration.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let candidates = [
            AllocationType::Anonymous,
            AllocationType::Huge,
            AllocationType::Contiguous,
            AllocationType::PreferContig,
            AllocationType::PreferHuge,
            AllocationType::Any,
        ];
        candidates
            .into_iter()
            .find(|ty| ty.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseAllocationTypeError(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_case_insensitive() {
        assert_eq!("anon".parse(), Ok(AllocationType::Anonymous));
        assert_eq!("HUGE".parse(), Ok(AllocationType::Huge));
        assert_eq!("Contig".parse(), Ok(AllocationType::Contiguous));
        assert_eq!("prefer_contig".parse(), Ok(AllocationType::PreferContig));
        assert_eq!("PREFER_HUGE".parse(), Ok(AllocationType::PreferHuge));
        assert_eq!("all".parse(), Ok(AllocationType::Any));
    }

    #[test]
    fn test_parse_rejects_hooks_and_garbage() {
        assert!("CUSTOM".parse::<AllocationType>().is_err());
        assert!("EXTERNAL".parse::<AllocationType>().is_err());
        assert!("hugepages".parse::<AllocationType>().is_err());
        assert!("".parse::<AllocationType>().is_err());
    }

    #[test]
    fn test_preferences_are_not_concrete() {
        assert!(AllocationType::Huge.is_concrete());
        assert!(AllocationType::Custom.is_concrete());
        assert!(!AllocationType::PreferHuge.is_concrete());
        assert!(!AllocationType::Any.is_concrete());
    }

    #[test]
    fn test_strategy_membership() {
        assert!(AllocationType::Any.tries_huge());
        assert!(AllocationType::Any.tries_contiguous());
        assert!(AllocationType::PreferHuge.tries_huge());
        assert!(!AllocationType::PreferHuge.tries_contiguous());
        assert!(!AllocationType::Anonymous.tries_huge());
        assert!(!AllocationType::Custom.tries_contiguous());
    }
}
