/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
//! The heap objects are archived from.
//!
//! It models the dumping process's heap: a reserved address range
//! `[base, base + capacity)` whose objects are bump allocated. Object memory
//! is kept in a byte vector indexed by `address - base`; addresses are only
//! ever used as numbers, so the range does not have to be mapped.
use super::compressed::OopEncoding;
use super::constants::OBJECT_ALIGNMENT;
use crate::oops::klass::{FieldType, KlassId, KlassKind, KlassTable, OBJECT_ARRAY_KLASS};
use crate::oops::object::{self, MarkWord, HEADER_SIZE};
use crate::oops::{Oop, SimpleVisitor, Slot};
use crate::utils::{get_u32, get_u64, put_u32, put_u64};
use heapsnap_os::align_up;

pub struct SourceHeap {
    base: u64,
    capacity: usize,
    memory: Vec<u8>,
    encoding: OopEncoding,
    klasses: KlassTable,
    objects: Vec<Oop>,
}

impl SourceHeap {
    pub fn new(klasses: KlassTable, base: u64, capacity: usize, encoding: OopEncoding) -> Self {
        assert_eq!(klasses.oop_size(), encoding.oop_size());
        if let OopEncoding::Compressed(narrow) = encoding {
            assert!(
                narrow.can_encode_range(base, base + capacity as u64),
                "heap [{:#x}, {:#x}) is not addressable with {:?}",
                base,
                base + capacity as u64,
                narrow
            );
        }
        Self {
            base,
            capacity,
            memory: vec![],
            encoding,
            klasses,
            objects: vec![],
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    /// End of the reserved range.
    pub fn reserved_end(&self) -> u64 {
        self.base + self.capacity as u64
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.memory.len()
    }

    pub fn encoding(&self) -> OopEncoding {
        self.encoding
    }

    pub fn klasses(&self) -> &KlassTable {
        &self.klasses
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.base + self.memory.len() as u64
    }

    /// Every object in allocation order.
    pub fn objects(&self) -> &[Oop] {
        &self.objects
    }

    fn offset_of(&self, obj: Oop) -> usize {
        debug_assert!(self.contains(obj.0), "{:?} is not in the heap", obj);
        (obj.0 - self.base) as usize
    }

    fn allocate(&mut self, size: usize, klass: KlassId, length: Option<usize>) -> Option<Oop> {
        let size = align_up(size, OBJECT_ALIGNMENT);
        let at = self.memory.len();
        if at + size > self.capacity {
            return None;
        }
        self.memory.resize(at + size, 0);
        object::init_header(&mut self.memory, at, klass, length);
        let obj = Oop(self.base + at as u64);
        self.objects.push(obj);
        Some(obj)
    }

    pub fn allocate_instance(&mut self, klass: KlassId) -> Option<Oop> {
        let k = self.klasses.klass(klass);
        debug_assert!(!k.is_array());
        let size = k.instance_size();
        self.allocate(size, klass, None)
    }

    pub fn allocate_array(&mut self, klass: KlassId, length: usize) -> Option<Oop> {
        let size = match self.klasses.klass(klass).kind() {
            KlassKind::ObjArray => object::array_byte_size(self.encoding.oop_size(), length),
            KlassKind::TypeArray { elem_size } => object::array_byte_size(*elem_size, length),
            KlassKind::Instance => return None,
        };
        self.allocate(size, klass, Some(length))
    }

    pub fn allocate_obj_array(&mut self, length: usize) -> Option<Oop> {
        self.allocate_array(OBJECT_ARRAY_KLASS, length)
    }

    pub fn klass_of(&self, obj: Oop) -> KlassId {
        object::klass_id(&self.memory, self.offset_of(obj))
    }

    pub fn size_of(&self, obj: Oop) -> usize {
        self.klasses.object_size(&self.memory, self.offset_of(obj))
    }

    pub fn array_length(&self, obj: Oop) -> usize {
        object::array_length(&self.memory, self.offset_of(obj))
    }

    /// Raw bytes of `obj`, header included.
    pub fn object_bytes(&self, obj: Oop) -> &[u8] {
        let at = self.offset_of(obj);
        &self.memory[at..at + self.size_of(obj)]
    }

    pub fn mark(&self, obj: Oop) -> MarkWord {
        object::mark(&self.memory, self.offset_of(obj))
    }

    pub fn set_mark(&mut self, obj: Oop, mark: MarkWord) {
        let at = self.offset_of(obj);
        object::set_mark(&mut self.memory, at, mark);
    }

    pub fn set_identity_hash(&mut self, obj: Oop, hash: u32) {
        let mark = self.mark(obj).copy_set_hash(hash);
        self.set_mark(obj, mark);
    }

    fn field_at(&self, obj: Oop, index: usize, ty: FieldType) -> usize {
        let field = self.klasses.klass(self.klass_of(obj)).field(index);
        assert_eq!(field.ty, ty, "field {} has type {:?}", index, field.ty);
        self.offset_of(obj) + field.offset
    }

    pub fn set_oop_field(&mut self, obj: Oop, index: usize, value: Option<Oop>) {
        let at = self.field_at(obj, index, FieldType::Oop);
        self.encoding
            .store(&mut self.memory, at, value.map(Oop::address).unwrap_or(0));
    }

    pub fn oop_field(&self, obj: Oop, index: usize) -> Option<Oop> {
        let at = self.field_at(obj, index, FieldType::Oop);
        Oop::from_address(self.encoding.load(&self.memory, at))
    }

    pub fn set_metadata_field(&mut self, obj: Oop, index: usize, value: u64) {
        let at = self.field_at(obj, index, FieldType::Metadata);
        put_u64(&mut self.memory, at, value);
    }

    pub fn metadata_field(&self, obj: Oop, index: usize) -> u64 {
        get_u64(&self.memory, self.field_at(obj, index, FieldType::Metadata))
    }

    pub fn set_int_field(&mut self, obj: Oop, index: usize, value: i32) {
        let at = self.field_at(obj, index, FieldType::Int);
        put_u32(&mut self.memory, at, value as u32);
    }

    pub fn int_field(&self, obj: Oop, index: usize) -> i32 {
        get_u32(&self.memory, self.field_at(obj, index, FieldType::Int)) as i32
    }

    pub fn set_long_field(&mut self, obj: Oop, index: usize, value: i64) {
        let at = self.field_at(obj, index, FieldType::Long);
        put_u64(&mut self.memory, at, value as u64);
    }

    pub fn long_field(&self, obj: Oop, index: usize) -> i64 {
        get_u64(&self.memory, self.field_at(obj, index, FieldType::Long)) as i64
    }

    fn element_at(&self, array: Oop, index: usize) -> usize {
        assert!(index < self.array_length(array));
        self.offset_of(array) + HEADER_SIZE + index * self.encoding.oop_size()
    }

    pub fn set_element(&mut self, array: Oop, index: usize, value: Option<Oop>) {
        debug_assert_eq!(
            self.klasses.klass(self.klass_of(array)).kind(),
            &KlassKind::ObjArray
        );
        let at = self.element_at(array, index);
        self.encoding
            .store(&mut self.memory, at, value.map(Oop::address).unwrap_or(0));
    }

    pub fn element(&self, array: Oop, index: usize) -> Option<Oop> {
        Oop::from_address(self.encoding.load(&self.memory, self.element_at(array, index)))
    }

    pub fn set_bytes(&mut self, array: Oop, bytes: &[u8]) {
        let at = self.offset_of(array) + HEADER_SIZE;
        assert!(bytes.len() <= self.array_length(array));
        self.memory[at..at + bytes.len()].copy_from_slice(bytes);
    }

    /// Decoded reference stored `offset` bytes into `obj`.
    pub fn load_oop_at(&self, obj: Oop, offset: usize) -> u64 {
        self.encoding.load(&self.memory, self.offset_of(obj) + offset)
    }

    pub fn load_u64_at(&self, obj: Oop, offset: usize) -> u64 {
        get_u64(&self.memory, self.offset_of(obj) + offset)
    }

    pub fn iterate_slots(&self, obj: Oop, f: &mut dyn FnMut(Slot)) {
        self.klasses.iterate_slots(
            &self.memory,
            self.offset_of(obj),
            &mut SimpleVisitor::new(f),
        );
    }
}
