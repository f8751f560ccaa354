//! Character-wise operational transform for the shared buffer.
//!
//! A [`TextOperation`] walks the whole document once:
//!
//! ```text
//! "hello world"   Retain(6) Delete(5) Insert("there")   "hello there"
//! ```
//!
//! Lengths are counted in Unicode scalar values, so clients and server agree
//! on positions regardless of how strings are stored. Components are kept in
//! canonical form: adjacent components of the same kind are merged and an
//! insert always precedes a delete at the same position, which makes two
//! operations with the same effect compare equal.

use serde::{Deserialize, Serialize};

/// A single step of a [`TextOperation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    /// Keep the next N characters.
    Retain(usize),
    /// Insert text at the current position.
    Insert(String),
    /// Remove the next N characters.
    Delete(usize),
}

/// A full-document edit.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<Component>", into = "Vec<Component>")]
pub struct TextOperation {
    components: Vec<Component>,
    /// Length of the document this operation applies to.
    base_len: usize,
    /// Length of the document after applying it.
    target_len: usize,
}

/// Errors from applying or transforming operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OtError {
    #[error("operation expects a document of {expected} characters, found {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("concurrent operations disagree on base length ({left} vs {right})")]
    BaseMismatch { left: usize, right: usize },
    #[error("operation lengths overflow")]
    LengthOverflow,
}

impl TextOperation {
    pub fn new() -> Self {
        Self::default()
    }

    /// An operation that keeps a document of `len` characters unchanged.
    pub fn identity(len: usize) -> Self {
        let mut op = Self::new();
        op.retain(len);
        op
    }

    pub fn retain(&mut self, n: usize) -> &mut Self {
        if n == 0 {
            return self;
        }
        self.base_len = self.base_len.saturating_add(n);
        self.target_len = self.target_len.saturating_add(n);
        if let Some(Component::Retain(last)) = self.components.last_mut() {
            *last = last.saturating_add(n);
        } else {
            self.components.push(Component::Retain(n));
        }
        self
    }

    pub fn insert(&mut self, text: &str) -> &mut Self {
        if text.is_empty() {
            return self;
        }
        self.target_len = self.target_len.saturating_add(text.chars().count());
        if let Some(Component::Insert(last)) = self.components.last_mut() {
            last.push_str(text);
            return self;
        }
        if matches!(self.components.last(), Some(Component::Delete(_))) {
            // Keep inserts ahead of deletes at the same position.
            let n = self.components.len();
            if n >= 2 {
                if let Component::Insert(prev) = &mut self.components[n - 2] {
                    prev.push_str(text);
                    return self;
                }
            }
            self.components.insert(n - 1, Component::Insert(text.to_owned()));
            return self;
        }
        self.components.push(Component::Insert(text.to_owned()));
        self
    }

    pub fn delete(&mut self, n: usize) -> &mut Self {
        if n == 0 {
            return self;
        }
        self.base_len = self.base_len.saturating_add(n);
        if let Some(Component::Delete(last)) = self.components.last_mut() {
            *last = last.saturating_add(n);
        } else {
            self.components.push(Component::Delete(n));
        }
        self
    }

    pub fn base_len(&self) -> usize {
        self.base_len
    }

    pub fn target_len(&self) -> usize {
        self.target_len
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    /// True when applying the operation leaves the document unchanged.
    pub fn is_noop(&self) -> bool {
        self.components
            .iter()
            .all(|c| matches!(c, Component::Retain(_)))
    }

    /// Apply to `doc`, producing the new document.
    pub fn apply(&self, doc: &str) -> Result<String, OtError> {
        let actual = doc.chars().count();
        if actual != self.base_len {
            return Err(OtError::LengthMismatch {
                expected: self.base_len,
                actual,
            });
        }

        let mut out = String::with_capacity(doc.len());
        let mut chars = doc.chars();
        for component in &self.components {
            match component {
                Component::Retain(n) => out.extend(chars.by_ref().take(*n)),
                Component::Insert(text) => out.push_str(text),
                Component::Delete(n) => {
                    chars.by_ref().take(*n).for_each(drop);
                }
            }
        }
        Ok(out)
    }

    /// Build the operation that turns `old` into `new` with a single
    /// replaced span (common prefix and suffix are retained).
    pub fn diff(old: &str, new: &str) -> Self {
        let old_chars: Vec<char> = old.chars().collect();
        let new_chars: Vec<char> = new.chars().collect();

        let prefix = old_chars
            .iter()
            .zip(&new_chars)
            .take_while(|(a, b)| a == b)
            .count();
        let suffix = old_chars[prefix..]
            .iter()
            .rev()
            .zip(new_chars[prefix..].iter().rev())
            .take_while(|(a, b)| a == b)
            .count();

        let inserted: String = new_chars[prefix..new_chars.len() - suffix].iter().collect();
        let mut op = Self::new();
        op.retain(prefix)
            .insert(&inserted)
            .delete(old_chars.len() - prefix - suffix)
            .retain(suffix);
        op
    }

    /// Transform two operations made against the same document.
    ///
    /// Returns `(a', b')` such that `apply(apply(doc, a), b') ==
    /// apply(apply(doc, b), a')`. When both insert at the same position,
    /// `a`'s text lands first.
    pub fn transform(a: &Self, b: &Self) -> Result<(Self, Self), OtError> {
        if a.base_len != b.base_len {
            return Err(OtError::BaseMismatch {
                left: a.base_len,
                right: b.base_len,
            });
        }

        let mut a_prime = Self::new();
        let mut b_prime = Self::new();

        let mut iter_a = a.components.iter().cloned();
        let mut iter_b = b.components.iter().cloned();
        let mut next_a = iter_a.next();
        let mut next_b = iter_b.next();

        loop {
            match (next_a.take(), next_b.take()) {
                (None, None) => break,
                (Some(Component::Insert(text)), other) => {
                    a_prime.insert(&text);
                    b_prime.retain(text.chars().count());
                    next_a = iter_a.next();
                    next_b = other;
                }
                (other, Some(Component::Insert(text))) => {
                    a_prime.retain(text.chars().count());
                    b_prime.insert(&text);
                    next_a = other;
                    next_b = iter_b.next();
                }
                (Some(Component::Retain(x)), Some(Component::Retain(y))) => {
                    let n = x.min(y);
                    a_prime.retain(n);
                    b_prime.retain(n);
                    next_a = remainder(Component::Retain, x - n, &mut iter_a);
                    next_b = remainder(Component::Retain, y - n, &mut iter_b);
                }
                (Some(Component::Delete(x)), Some(Component::Delete(y))) => {
                    // Both removed the same span; nothing left to do.
                    let n = x.min(y);
                    next_a = remainder(Component::Delete, x - n, &mut iter_a);
                    next_b = remainder(Component::Delete, y - n, &mut iter_b);
                }
                (Some(Component::Delete(x)), Some(Component::Retain(y))) => {
                    let n = x.min(y);
                    a_prime.delete(n);
                    next_a = remainder(Component::Delete, x - n, &mut iter_a);
                    next_b = remainder(Component::Retain, y - n, &mut iter_b);
                }
                (Some(Component::Retain(x)), Some(Component::Delete(y))) => {
                    let n = x.min(y);
                    b_prime.delete(n);
                    next_a = remainder(Component::Retain, x - n, &mut iter_a);
                    next_b = remainder(Component::Delete, y - n, &mut iter_b);
                }
                // Equal base lengths rule out one side running dry first.
                (Some(_), None) | (None, Some(_)) => {
                    return Err(OtError::BaseMismatch {
                        left: a.base_len,
                        right: b.base_len,
                    });
                }
            }
        }

        Ok((a_prime, b_prime))
    }
}

fn remainder(
    kind: fn(usize) -> Component,
    left: usize,
    iter: &mut impl Iterator<Item = Component>,
) -> Option<Component> {
    if left > 0 {
        Some(kind(left))
    } else {
        iter.next()
    }
}

/// Components arrive from clients, so the running lengths are checked before
/// anything is built from them.
impl TryFrom<Vec<Component>> for TextOperation {
    type Error = OtError;

    fn try_from(components: Vec<Component>) -> Result<Self, Self::Error> {
        let mut base_len = 0usize;
        let mut target_len = 0usize;
        for component in &components {
            let (base, target) = match component {
                Component::Retain(n) => (*n, *n),
                Component::Insert(text) => (0, text.chars().count()),
                Component::Delete(n) => (*n, 0),
            };
            base_len = base_len.checked_add(base).ok_or(OtError::LengthOverflow)?;
            target_len = target_len
                .checked_add(target)
                .ok_or(OtError::LengthOverflow)?;
        }

        let mut op = Self::new();
        for component in components {
            match component {
                Component::Retain(n) => op.retain(n),
                Component::Insert(text) => op.insert(&text),
                Component::Delete(n) => op.delete(n),
            };
        }
        Ok(op)
    }
}

impl From<TextOperation> for Vec<Component> {
    fn from(op: TextOperation) -> Self {
        op.components
    }
}
