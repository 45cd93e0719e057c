//! Error taxonomy shared by every map variant.
//!
//! Absence is never an error: lookups and removals report a missing key
//! with `None`.

use core::fmt;

#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum MapError {
    /// A construction parameter or a supplied value was rejected.
    InvalidArgument(&'static str),
    /// The map was structurally modified while a fail-fast traversal was
    /// in progress, through a path other than the traversal itself.
    ConcurrentModification,
    /// An iterator operation was called in a state that does not allow it.
    IllegalState(&'static str),
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::InvalidArgument(what) => write!(f, "invalid argument: {what}"),
            MapError::ConcurrentModification => {
                f.write_str("map was structurally modified during traversal")
            }
            MapError::IllegalState(what) => write!(f, "illegal state: {what}"),
        }
    }
}

impl std::error::Error for MapError {}

#[cfg(test)]
mod tests {
    use super::MapError;

    #[test]
    fn display_names_the_failure() {
        let e = MapError::InvalidArgument("load factor must be positive");
        assert_eq!(e.to_string(), "invalid argument: load factor must be positive");
        assert_eq!(
            MapError::ConcurrentModification.to_string(),
            "map was structurally modified during traversal"
        );
        assert!(MapError::IllegalState("no current entry")
            .to_string()
            .contains("no current entry"));
    }

    #[test]
    fn is_a_std_error() {
        fn takes(_: &dyn std::error::Error) {}
        takes(&MapError::ConcurrentModification);
    }
}
