//! Symbol interner for identifiers, labels and synthesized names.
//!
//! Scope lookups, the symbol table and goto-label resolution all key on
//! [`Name`] handles, so identifier comparison is integer comparison.
//! Besides source identifiers, the compiler mints hidden names of its
//! own (compound-literal temporaries, string-literal and constant-pool
//! labels); [`Interner::synthesize`] produces those with a dotted
//! prefix, which no C identifier can collide with.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;

/// An interned string identifier.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash, PartialOrd, Ord)]
pub struct Name(pub usize);

/// A reference-counted string handle, cheap to hand out of the
/// interner's lock.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ArcStr(Arc<String>);

impl fmt::Display for ArcStr {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(f, "{}", &*self.0)
    }
}

impl fmt::Debug for ArcStr {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(f, "{}", &*self.0)
    }
}

impl Borrow<str> for ArcStr {
    fn borrow(&self) -> &str {
        &self.0[..]
    }
}

impl Deref for ArcStr {
    type Target = String;

    fn deref(&self) -> &String {
        &self.0
    }
}

#[derive(Debug, Default)]
struct Symbols {
    map: HashMap<ArcStr, Name>,
    names: Vec<ArcStr>,
    /// Counter for compiler-minted names.
    synthesized: usize,
}

impl Symbols {
    fn insert(&mut self, text: String) -> Name {
        let key = ArcStr(Arc::new(text));
        let name = Name(self.names.len());
        self.names.push(key.clone());
        self.map.insert(key, name);
        name
    }
}

/// A thread-safe symbol interner.
#[derive(Debug, Default)]
pub struct Interner {
    symbols: Mutex<Symbols>,
}

impl Interner {
    pub fn new() -> Interner {
        Interner::default()
    }

    /// Intern a source identifier, returning its unique [`Name`].
    ///
    /// If the string was already interned, returns the existing name.
    pub fn intern(&self, text: &str) -> Name {
        let mut symbols = self.symbols.lock();
        if let Some(&name) = symbols.map.get(text) {
            return name;
        }
        symbols.insert(String::from(text))
    }

    /// Mint a fresh compiler-internal name like `.complit.3`.
    ///
    /// The leading-dot spelling cannot be produced by the lexer's
    /// identifier rule, so synthesized names never shadow or collide
    /// with source symbols.
    pub fn synthesize(&self, prefix: &str) -> Name {
        let mut symbols = self.symbols.lock();
        let counter = symbols.synthesized;
        symbols.synthesized += 1;
        let text = format!(".{}.{}", prefix, counter);
        debug_assert!(!symbols.map.contains_key(text.as_str()));
        symbols.insert(text)
    }

    /// Get the string for a previously interned [`Name`].
    pub fn str(&self, name: Name) -> ArcStr {
        let symbols = self.symbols.lock();
        symbols.names[name.0].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_deduplicates() {
        let interner = Interner::new();

        assert_eq!(Name(0), interner.intern("main"));
        assert_eq!(Name(0), interner.intern("main"));

        assert_eq!(Name(1), interner.intern("fib"));
        assert_eq!(Name(1), interner.intern("fib"));

        assert_eq!("main", *interner.str(Name(0)));
        assert_eq!("fib", *interner.str(Name(1)));
    }

    #[test]
    fn test_synthesized_names_are_fresh() {
        let interner = Interner::new();
        let a = interner.synthesize("complit");
        let b = interner.synthesize("complit");
        assert_ne!(a, b);
        assert_eq!(".complit.0", *interner.str(a));
        assert_eq!(".complit.1", *interner.str(b));
    }

    #[test]
    fn test_synthesized_names_cannot_shadow_identifiers() {
        let interner = Interner::new();
        let user = interner.intern("complit");
        let hidden = interner.synthesize("complit");
        assert_ne!(user, hidden);
        assert!(interner.str(hidden).starts_with('.'));
    }
}
