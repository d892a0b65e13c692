//! Growable arrays with fallible allocation.
//!
//! Running out of memory is reported as [`Error::NoMemory`]. A failed grow
//! leaves the existing contents untouched.

use std::ops::{Deref, DerefMut};

use crate::{Error, Result};

/// A `Vec` whose growth is checked.
#[derive(Debug, Clone)]
pub struct Block<T> {
    label: &'static str,
    items: Vec<T>,
}

impl<T> Block<T> {
    /// Create an empty block. `label` names it in allocation errors.
    pub const fn new(label: &'static str) -> Self {
        Self {
            label,
            items: Vec::new(),
        }
    }

    /// Make room for `additional` more items.
    pub fn reserve(&mut self, additional: usize) -> Result<()> {
        self.items
            .try_reserve(additional)
            .map_err(|_| Error::NoMemory(self.label))
    }

    pub fn push(&mut self, item: T) -> Result<()> {
        self.reserve(1)?;
        self.items.push(item);
        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> T {
        self.items.remove(index)
    }

    pub fn retain(&mut self, keep: impl FnMut(&T) -> bool) {
        self.items.retain(keep);
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Remove and return every item.
    pub fn take(&mut self) -> Vec<T> {
        std::mem::take(&mut self.items)
    }
}

impl<T: Clone> Block<T> {
    /// Resize to exactly `len` items, filling with `value`.
    pub fn resize(&mut self, len: usize, value: T) -> Result<()> {
        if len > self.items.len() {
            self.reserve(len - self.items.len())?;
        }
        self.items.resize(len, value);
        Ok(())
    }
}

impl<T> Deref for Block<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.items
    }
}

impl<T> DerefMut for Block<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        &mut self.items
    }
}
