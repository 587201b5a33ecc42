/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
//! A self-checking object graph for the command line tool and benchmarks.
//!
//! `n` `Node` objects form a ring through their `next` field. Each node
//! names a closed `byte[]`, carries a value, a long id and a pointer into
//! the rw metadata region. The roots are node 0, node `n / 2` and the name
//! of node 0.
use crate::archive::{ArchiveSelection, MetadataDelta};
use crate::dump::MetadataArchive;
use crate::error::{ArchiveError, Result};
use crate::filemap::CoreRegions;
use crate::gc::bitmap::RelocBitmap;
use crate::gc::compressed::OopEncoding;
use crate::gc::runtime_heap::ArchiveHeapSupport;
use crate::gc::source_heap::SourceHeap;
use crate::loader::LoadedHeap;
use crate::oops::klass::{FieldType, KlassId, KlassTable, BYTE_ARRAY_KLASS};
use crate::oops::object::HEADER_SIZE;
use crate::utils::get_u64;

/// Bottom of the heap the demo graph is dumped from.
pub const DUMP_HEAP_BASE: u64 = 0x6_0000_0000;
/// Where the dumping process keeps its metadata.
pub const METADATA_DUMP_BASE: u64 = 0x7f00_0000_0000;
/// Where archived metadata is requested to be mapped.
pub const METADATA_REQUESTED_BASE: u64 = 0x8_0000_0000;

const RW_SLOTS: usize = 8;

pub const NEXT: usize = 0;
pub const NAME: usize = 1;
pub const VALUE: usize = 2;
pub const INFO: usize = 3;
pub const ID: usize = 4;

/// Klass table shared by the dumping and the loading side.
pub fn demo_klasses(oop_size: usize) -> (KlassTable, KlassId) {
    let mut table = KlassTable::new(oop_size);
    let node = table.register_instance(
        "Node",
        &[
            FieldType::Oop,
            FieldType::Oop,
            FieldType::Int,
            FieldType::Metadata,
            FieldType::Long,
        ],
    );
    (table, node)
}

fn node_name(i: usize) -> String {
    format!("node-{}", i)
}

fn node_value(i: usize) -> i32 {
    (i as i32).wrapping_mul(7) - 3
}

fn metadata_offset(i: usize) -> u64 {
    (i % RW_SLOTS) as u64 * 8
}

pub struct DemoGraph {
    pub heap: SourceHeap,
    pub selection: ArchiveSelection,
    pub relocator: MetadataDelta,
    pub node_klass: KlassId,
    pub nodes: usize,
}

impl DemoGraph {
    /// Builds the graph in a fresh source heap `[base, base + capacity)`.
    pub fn build(encoding: OopEncoding, base: u64, capacity: usize, nodes: usize) -> Result<Self> {
        assert!(nodes > 0);
        let (klasses, node_klass) = demo_klasses(encoding.oop_size());
        let mut heap = SourceHeap::new(klasses, base, capacity, encoding);
        let oom = || ArchiveError::HeapAllocation { size: capacity };

        let mut ring = Vec::with_capacity(nodes);
        let mut names = Vec::with_capacity(nodes);
        for i in 0..nodes {
            let name = node_name(i);
            let bytes = heap
                .allocate_array(BYTE_ARRAY_KLASS, name.len())
                .ok_or_else(oom)?;
            heap.set_bytes(bytes, name.as_bytes());
            let node = heap.allocate_instance(node_klass).ok_or_else(oom)?;
            heap.set_oop_field(node, NAME, Some(bytes));
            heap.set_int_field(node, VALUE, node_value(i));
            heap.set_long_field(node, ID, i as i64);
            heap.set_metadata_field(node, INFO, METADATA_DUMP_BASE + metadata_offset(i));
            if i % 3 == 0 {
                heap.set_identity_hash(node, 0x1000 + i as u32);
            }
            ring.push(node);
            names.push(bytes);
        }
        for i in 0..nodes {
            heap.set_oop_field(ring[i], NEXT, Some(ring[(i + 1) % nodes]));
        }

        let selection = ArchiveSelection {
            roots: vec![ring[0], ring[nodes / 2], names[0]],
            open: ring,
            closed: names,
        };
        Ok(Self {
            heap,
            selection,
            relocator: MetadataDelta(METADATA_REQUESTED_BASE.wrapping_sub(METADATA_DUMP_BASE) as i64),
            node_klass,
            nodes,
        })
    }

    /// Metadata the nodes point into: rw holds pointers to ro, already in
    /// requested form.
    pub fn metadata(alignment: u64) -> MetadataArchive {
        let mut archive = MetadataArchive::empty(METADATA_REQUESTED_BASE);
        archive.rw = vec![0u8; RW_SLOTS * 8];
        archive.ro = (0..RW_SLOTS as u64).flat_map(|k| k.to_le_bytes().to_vec()).collect();
        let ro_base = METADATA_REQUESTED_BASE + archive.ro_mapping_offset(alignment);
        archive.rw_ptrmap = RelocBitmap::with_size(RW_SLOTS);
        for k in 0..RW_SLOTS {
            let value = ro_base + k as u64 * 8;
            archive.rw[k * 8..k * 8 + 8].copy_from_slice(&value.to_le_bytes());
            archive.rw_ptrmap.set(k);
        }
        archive.code = vec![0xcc; 16];
        archive
    }
}

/// Walks the loaded ring and checks every node against what
/// [`DemoGraph::build`] created. `metadata_base` is where the rw region
/// ended up; `None` skips the metadata checks.
pub fn verify_demo<H: ArchiveHeapSupport + ?Sized>(
    heap: &H,
    loaded: &LoadedHeap,
    nodes: usize,
    node_klass: KlassId,
    metadata_base: Option<u64>,
) -> std::result::Result<(), String> {
    if loaded.root_count() != 3 {
        return Err(format!("expected 3 roots, found {}", loaded.root_count()));
    }
    let first = loaded.root(heap, 0).ok_or("root 0 is null")?;
    let mut cur = first;
    for i in 0..nodes {
        if !loaded.contains(cur) {
            return Err(format!("node {} at {:#x} is outside the archived heap", i, cur));
        }
        if heap.klass_of(cur) != node_klass {
            return Err(format!("node {} at {:#x} has klass {}", i, cur, heap.klass_of(cur)));
        }
        if heap.int_field(cur, VALUE) != node_value(i) {
            return Err(format!("node {} has value {}", i, heap.int_field(cur, VALUE)));
        }
        if i % 3 == 0 && heap.identity_hash(cur) != 0x1000 + i as u32 {
            return Err(format!("node {} lost its identity hash", i));
        }
        let name = heap.oop_field(cur, NAME).ok_or_else(|| format!("node {} has no name", i))?;
        let len = heap.array_length(name);
        let bytes = heap.memory(name + HEADER_SIZE as u64, len);
        if bytes != node_name(i).as_bytes() {
            return Err(format!(
                "node {} is named {:?}",
                i,
                String::from_utf8_lossy(bytes)
            ));
        }
        if i == nodes / 2 && loaded.root(heap, 1) != Some(cur) {
            return Err("root 1 does not reach the middle node".to_string());
        }
        if i == 0 && loaded.root(heap, 2) != Some(name) {
            return Err("root 2 is not the name of node 0".to_string());
        }
        if let Some(base) = metadata_base {
            let info = heap.metadata_field(cur, INFO);
            if info != base + metadata_offset(i) {
                return Err(format!(
                    "node {} points to metadata {:#x}, expected {:#x}",
                    i,
                    info,
                    base + metadata_offset(i)
                ));
            }
        }
        cur = heap.oop_field(cur, NEXT).ok_or_else(|| format!("node {} has no next", i))?;
    }
    if cur != first {
        return Err(format!("ring of {} nodes does not close", nodes));
    }
    Ok(())
}

/// Follows the pointer stored in rw slot `k` of relocated metadata.
pub fn metadata_slot(metadata: &CoreRegions, k: usize) -> u64 {
    get_u64(metadata.rw(), k * 8)
}
