/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
use super::object::{array_byte_size, HEADER_SIZE, LENGTH_OFFSET};
use super::{Slot, SlotKind, SlotVisitor};
use crate::gc::constants::{HEAP_WORD_SIZE, METADATA_POINTER_SIZE, OBJECT_ALIGNMENT};
use crate::utils::get_u32;
use heapsnap_os::align_up;

/// Value stored in the klass word of an object header. Zero is never a valid
/// id.
pub type KlassId = u32;

/// `int[]`, used for filler objects.
pub const FILLER_KLASS: KlassId = 1;
/// `Object[]`, used for the root table.
pub const OBJECT_ARRAY_KLASS: KlassId = 2;
/// `byte[]`
pub const BYTE_ARRAY_KLASS: KlassId = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldType {
    Oop,
    Metadata,
    Int,
    Long,
}

impl FieldType {
    pub fn size(self, oop_size: usize) -> usize {
        match self {
            FieldType::Oop => oop_size,
            FieldType::Metadata => METADATA_POINTER_SIZE,
            FieldType::Int => 4,
            FieldType::Long => 8,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldLayout {
    pub ty: FieldType,
    pub offset: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KlassKind {
    Instance,
    ObjArray,
    TypeArray { elem_size: usize },
}

#[derive(Clone, Debug)]
pub struct Klass {
    id: KlassId,
    name: String,
    kind: KlassKind,
    fields: Vec<FieldLayout>,
    instance_size: usize,
}

impl Klass {
    pub fn id(&self) -> KlassId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &KlassKind {
        &self.kind
    }

    pub fn is_array(&self) -> bool {
        !matches!(self.kind, KlassKind::Instance)
    }

    pub fn fields(&self) -> &[FieldLayout] {
        &self.fields
    }

    pub fn field(&self, index: usize) -> FieldLayout {
        self.fields[index]
    }

    /// Byte size of an instance; arrays size themselves by length.
    pub fn instance_size(&self) -> usize {
        self.instance_size
    }
}

/// Registry of every klass objects may refer to. The table used at runtime
/// must register the same klasses in the same order as the dumping one.
#[derive(Clone, Debug)]
pub struct KlassTable {
    klasses: Vec<Klass>,
    oop_size: usize,
}

impl KlassTable {
    pub fn new(oop_size: usize) -> Self {
        let mut table = Self {
            klasses: vec![],
            oop_size,
        };
        table.register_type_array("int[]", 4);
        table.register_obj_array("Object[]");
        table.register_type_array("byte[]", 1);
        table
    }

    pub fn oop_size(&self) -> usize {
        self.oop_size
    }

    fn next_id(&self) -> KlassId {
        self.klasses.len() as KlassId + 1
    }

    pub fn register_instance(&mut self, name: &str, field_types: &[FieldType]) -> KlassId {
        let mut cursor = HEADER_SIZE;
        let mut fields = Vec::with_capacity(field_types.len());
        for ty in field_types {
            let size = ty.size(self.oop_size);
            let offset = align_up(cursor, size);
            fields.push(FieldLayout { ty: *ty, offset });
            cursor = offset + size;
        }
        let id = self.next_id();
        self.klasses.push(Klass {
            id,
            name: name.to_string(),
            kind: KlassKind::Instance,
            fields,
            instance_size: align_up(cursor, OBJECT_ALIGNMENT),
        });
        id
    }

    pub fn register_obj_array(&mut self, name: &str) -> KlassId {
        self.register_array(name, KlassKind::ObjArray)
    }

    pub fn register_type_array(&mut self, name: &str, elem_size: usize) -> KlassId {
        self.register_array(name, KlassKind::TypeArray { elem_size })
    }

    fn register_array(&mut self, name: &str, kind: KlassKind) -> KlassId {
        let id = self.next_id();
        self.klasses.push(Klass {
            id,
            name: name.to_string(),
            kind,
            fields: vec![],
            instance_size: HEADER_SIZE,
        });
        id
    }

    pub fn get(&self, id: KlassId) -> Option<&Klass> {
        if id == 0 {
            return None;
        }
        self.klasses.get(id as usize - 1)
    }

    /// Klass of a well-formed object. Panics on an id this table never
    /// handed out, which means the heap is corrupt.
    pub fn klass(&self, id: KlassId) -> &Klass {
        match self.get(id) {
            Some(klass) => klass,
            None => panic!("unknown klass id {}", id),
        }
    }

    pub fn len(&self) -> usize {
        self.klasses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.klasses.is_empty()
    }

    /// Byte size of the object starting at `at`. A one-word filler counts
    /// as a heap word.
    pub fn object_size(&self, bytes: &[u8], at: usize) -> usize {
        if super::object::is_filler_word(bytes, at) {
            return HEAP_WORD_SIZE;
        }
        let klass = self.klass(super::object::klass_id(bytes, at));
        match klass.kind {
            KlassKind::Instance => klass.instance_size,
            KlassKind::ObjArray => {
                array_byte_size(self.oop_size, get_u32(bytes, at + LENGTH_OFFSET) as usize)
            }
            KlassKind::TypeArray { elem_size } => {
                array_byte_size(elem_size, get_u32(bytes, at + LENGTH_OFFSET) as usize)
            }
        }
    }

    /// Reports every reference and metadata slot of the object at `at`.
    pub fn iterate_slots(&self, bytes: &[u8], at: usize, visitor: &mut dyn SlotVisitor) {
        if super::object::is_filler_word(bytes, at) {
            return;
        }
        let klass = self.klass(super::object::klass_id(bytes, at));
        match klass.kind {
            KlassKind::Instance => {
                for field in &klass.fields {
                    let kind = match field.ty {
                        FieldType::Oop => SlotKind::Oop,
                        FieldType::Metadata => SlotKind::Metadata,
                        _ => continue,
                    };
                    visitor.visit(Slot {
                        offset: field.offset,
                        kind,
                    });
                }
            }
            KlassKind::ObjArray => {
                let len = get_u32(bytes, at + LENGTH_OFFSET) as usize;
                for i in 0..len {
                    visitor.visit(Slot {
                        offset: HEADER_SIZE + i * self.oop_size,
                        kind: SlotKind::Oop,
                    });
                }
            }
            KlassKind::TypeArray { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oops::SimpleVisitor;

    #[test]
    fn test_instance_layout_compressed() {
        let mut table = KlassTable::new(4);
        let id = table.register_instance(
            "Node",
            &[FieldType::Oop, FieldType::Long, FieldType::Oop, FieldType::Metadata],
        );
        let klass = table.klass(id);
        let offsets: Vec<usize> = klass.fields().iter().map(|f| f.offset).collect();
        assert_eq!(offsets, vec![16, 24, 32, 40]);
        assert_eq!(klass.instance_size(), 48);
    }

    #[test]
    fn test_instance_layout_uncompressed() {
        let mut table = KlassTable::new(8);
        let id = table.register_instance("Pair", &[FieldType::Int, FieldType::Oop]);
        let klass = table.klass(id);
        assert_eq!(klass.field(0).offset, 16);
        assert_eq!(klass.field(1).offset, 24);
        assert_eq!(klass.instance_size(), 32);
    }

    #[test]
    fn test_builtin_klasses() {
        let table = KlassTable::new(4);
        assert_eq!(table.klass(FILLER_KLASS).name(), "int[]");
        assert_eq!(table.klass(OBJECT_ARRAY_KLASS).kind(), &KlassKind::ObjArray);
        assert!(table.get(0).is_none());
    }

    #[test]
    fn test_iterate_array_slots() {
        let table = KlassTable::new(4);
        let mut bytes = vec![0u8; 32];
        crate::utils::put_u32(&mut bytes, 8, OBJECT_ARRAY_KLASS);
        crate::utils::put_u32(&mut bytes, 12, 3);
        assert_eq!(table.object_size(&bytes, 0), 32);

        let mut seen = vec![];
        let mut closure = |slot: Slot| seen.push(slot.offset);
        table.iterate_slots(&bytes, 0, &mut SimpleVisitor::new(&mut closure));
        assert_eq!(seen, vec![16, 20, 24]);
    }

    #[test]
    fn test_one_word_filler_is_skipped() {
        let table = KlassTable::new(4);
        let mut bytes = vec![0u8; 24];
        assert!(crate::oops::object::write_filler(&mut bytes, 0, 8));
        crate::oops::object::init_header(&mut bytes, 8, FILLER_KLASS, Some(0));
        assert_eq!(table.object_size(&bytes, 0), 8);
        assert_eq!(table.object_size(&bytes, 8), 16);

        let mut seen = 0;
        let mut closure = |_: Slot| seen += 1;
        table.iterate_slots(&bytes, 0, &mut SimpleVisitor::new(&mut closure));
        assert_eq!(seen, 0);
    }
}
