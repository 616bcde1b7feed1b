//! Type Registry
//!
//! Stores named type definitions (`@Name` references) and the parsed
//! signature cache keyed by signature text.

use std::collections::HashMap;
use std::ops::Deref;
use std::rc::Rc;

use super::{SigKind, SigRef, TypeSig, parse_signature};
use crate::error::{InteropError, InteropResult};

/// Longest chain of `@A -> @B -> ...` aliases followed before giving up.
const MAX_ALIAS_DEPTH: usize = 32;

/// Parsed signatures, keyed by their exact text.
#[derive(Debug, Default)]
pub struct SignatureCache {
    entries: HashMap<String, SigRef>,
    hits: usize,
    misses: usize,
}

impl SignatureCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `text`, or return the previously parsed tree.
    pub fn get_or_parse(&mut self, text: &str) -> InteropResult<SigRef> {
        if let Some(sig) = self.entries.get(text) {
            self.hits += 1;
            return Ok(sig.clone());
        }
        let sig = Rc::new(parse_signature(text)?);
        self.misses += 1;
        self.entries.insert(text.to_string(), sig.clone());
        Ok(sig)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// (hits, misses) since creation.
    pub fn stats(&self) -> (usize, usize) {
        (self.hits, self.misses)
    }
}

/// A signature with any top-level `@Name` reference followed.
pub enum Resolved<'a> {
    Borrowed(&'a TypeSig),
    Shared(SigRef),
}

impl Deref for Resolved<'_> {
    type Target = TypeSig;

    fn deref(&self) -> &TypeSig {
        match self {
            Resolved::Borrowed(sig) => sig,
            Resolved::Shared(sig) => sig,
        }
    }
}

/// The type registry stores named type definitions and the signature cache.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    named: HashMap<String, SigRef>,
    cache: SignatureCache,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register `name` so that `@name` resolves to `text`.
    pub fn define(&mut self, name: &str, text: &str) -> InteropResult<SigRef> {
        if name.is_empty()
            || !name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'$')
        {
            return Err(InteropError::signature(name, 0, "invalid type name"));
        }
        let sig = self.cache.get_or_parse(text)?;
        if self.named.insert(name.to_string(), sig.clone()).is_some() {
            log::debug!("redefined native type @{}", name);
        }
        Ok(sig)
    }

    /// Parse through the signature cache.
    pub fn parse(&mut self, text: &str) -> InteropResult<SigRef> {
        self.cache.get_or_parse(text)
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    pub fn lookup(&self, name: &str) -> InteropResult<SigRef> {
        self.named
            .get(name)
            .cloned()
            .ok_or_else(|| InteropError::resolution(format!("undefined native type @{}", name)))
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.named.contains_key(name)
    }

    /// Follow named references until a concrete signature is reached.
    pub fn resolve<'a>(&self, sig: &'a TypeSig) -> InteropResult<Resolved<'a>> {
        let SigKind::Named(name) = &sig.kind else {
            return Ok(Resolved::Borrowed(sig));
        };
        let mut current = self.lookup(name)?;
        for _ in 0..MAX_ALIAS_DEPTH {
            let next = match &current.kind {
                SigKind::Named(next) => self.lookup(next)?,
                _ => return Ok(Resolved::Shared(current)),
            };
            current = next;
        }
        Err(InteropError::resolution(format!(
            "type alias chain starting at @{} does not terminate",
            name
        )))
    }

    pub fn cache(&self) -> &SignatureCache {
        &self.cache
    }
}
