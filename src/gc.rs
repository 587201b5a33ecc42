/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
//! Heap-side collaborators of the archive: reference encodings, relocation
//! bitmaps, the heap objects are dumped from and the heap they are mapped
//! into.
pub mod bitmap;
pub mod compressed;
pub mod constants;
pub mod runtime_heap;
pub mod source_heap;
