/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
//! Object model shared by the dump-time and the runtime heap.
//!
//! Every object starts with a 16-byte header: the mark word, the 32-bit
//! klass id and, for arrays, the 32-bit length. Fields and elements follow.
pub mod klass;
pub mod object;

use core::fmt;

/// Address of a live object in the heap being dumped.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Oop(pub u64);

impl Oop {
    #[inline]
    pub fn address(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn from_address(addr: u64) -> Option<Oop> {
        if addr == 0 {
            None
        } else {
            Some(Oop(addr))
        }
    }
}

impl fmt::Debug for Oop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oop({:#x})", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotKind {
    /// Reference to another heap object.
    Oop,
    /// Native pointer into class metadata.
    Metadata,
}

/// A pointer-bearing slot of an object, relative to the object start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slot {
    pub offset: usize,
    pub kind: SlotKind,
}

pub trait SlotVisitor {
    fn visit(&mut self, slot: Slot);
}

pub struct SimpleVisitor<'a> {
    closure: &'a mut dyn FnMut(Slot),
}

impl<'a> SimpleVisitor<'a> {
    pub fn new(closure: &'a mut dyn FnMut(Slot)) -> Self {
        Self { closure }
    }
}

impl<'a> SlotVisitor for SimpleVisitor<'a> {
    fn visit(&mut self, slot: Slot) {
        (self.closure)(slot);
    }
}
