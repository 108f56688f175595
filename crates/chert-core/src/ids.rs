//! Unique identifiers used across the compiler.

use std::fmt;

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident, $display:literal) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl $name {
            pub fn new(index: u32) -> Self {
                Self(index)
            }

            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($display, "#{}"), self.0)
            }
        }
    };
}

define_id! {
    /// A lexical scope in the scope arena.
    ScopeId, "scope"
}

define_id! {
    /// A struct or union definition in the type interner's side table.
    StructId, "struct"
}

define_id! {
    /// A virtual register within one function's register table.
    VRegId, "v"
}

define_id! {
    /// A basic block within one function's block container.
    BBId, "bb"
}

define_id! {
    /// A stack frame slot (addressed locals, aggregates, spill homes).
    FrameSlotId, "frame"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_roundtrip() {
        let id = VRegId::new(42);
        assert_eq!(id.index(), 42);
        assert_eq!(id.to_string(), "v#42");
    }

    #[test]
    fn test_id_ordering() {
        assert!(BBId::new(1) < BBId::new(2));
    }
}
