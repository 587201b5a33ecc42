/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
use crate::demo::DUMP_HEAP_BASE;
use crate::gc::compressed::{NarrowOopEncoding, OopEncoding};
use crate::gc::constants::MIN_GC_REGION_ALIGNMENT;
use crate::gc::runtime_heap::RuntimeHeapConfig;
use crate::loader::LoadOptions;
use std::num::ParseIntError;
use std::path::PathBuf;
use structopt::StructOpt;

pub fn parse_size(s: &str) -> Result<usize, ParseIntError> {
    let s = s.to_lowercase();
    let (number, unit) = s.split_at(s.find(|c: char| !c.is_digit(10)).unwrap_or(s.len()));
    let multiplier = match unit {
        "kb" | "k" => 1024,
        "mb" | "m" => 1024 * 1024,
        "gb" | "g" => 1024 * 1024 * 1024,
        _ => 1,
    };

    number
        .parse::<usize>()
        .map_err(|x| x.into())
        .map(|x| x * multiplier)
}

#[derive(Debug, StructOpt, Clone, PartialEq, Eq)]
pub enum Command {
    /// Builds the demo object graph and archives it.
    #[structopt(name = "dump")]
    Dump {
        #[structopt(long = "nodes", default_value = "1000", help = "Number of objects in the ring")]
        nodes: usize,
    },
    /// Maps the archive into a fresh heap and checks the demo graph.
    #[structopt(name = "run")]
    Run {
        #[structopt(long = "nodes", default_value = "1000", help = "Number of objects in the ring")]
        nodes: usize,
    },
    /// Prints the archive header and region table.
    #[structopt(name = "print-header")]
    PrintHeader,
    /// Validates the header and every region checksum.
    #[structopt(name = "verify")]
    Verify,
}

#[derive(Debug, StructOpt, Clone)]
#[structopt(name = "heapsnap", about = "Archives object heap snapshots and maps them back at startup")]
pub struct Options {
    #[structopt(
        long = "archive",
        help = "Path of the archive file",
        default_value = "heapsnap.jsa",
        parse(from_os_str)
    )]
    pub archive: PathBuf,
    #[structopt(
        long = "heap-size",
        help = "Set maximum heap size",
        default_value = "64MB",
        parse(try_from_str=parse_size)
    )]
    pub heap_size: usize,
    #[structopt(
        long = "region-size",
        help = "Set heap region size",
        default_value = "1MB",
        parse(try_from_str=parse_size)
    )]
    pub region_size: usize,
    #[structopt(long = "no-compressed-oops", help = "Store references as full addresses")]
    pub no_compressed_oops: bool,
    #[structopt(long = "oop-shift", help = "Force heap based narrow oops with this shift")]
    pub oop_shift: Option<u32>,
    #[structopt(long = "gc-threads", help = "Threads used to patch references", default_value = "1")]
    pub gc_threads: usize,
    #[structopt(long = "skip-verify", help = "Do not check region checksums")]
    pub skip_verify: bool,
    #[structopt(long = "require-archive", help = "Fail when the archived heap can not be used")]
    pub require_archive: bool,
    #[structopt(long = "no-map", help = "Copy the archived heap instead of mapping it")]
    pub no_map: bool,
    #[structopt(long = "cds-verbose", help = "Enable verbose archive logging")]
    pub verbose: bool,
    #[structopt(subcommand)]
    pub command: Command,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            archive: PathBuf::from("heapsnap.jsa"),
            heap_size: 64 * 1024 * 1024,
            region_size: MIN_GC_REGION_ALIGNMENT,
            no_compressed_oops: false,
            oop_shift: None,
            gc_threads: 1,
            skip_verify: false,
            require_archive: false,
            no_map: false,
            verbose: false,
            command: Command::PrintHeader,
        }
    }
}

impl Options {
    pub fn with_archive(mut self, archive: impl Into<PathBuf>) -> Self {
        self.archive = archive.into();
        self
    }

    pub fn with_heap_size(mut self, size: usize) -> Self {
        self.heap_size = size;
        self
    }

    pub fn with_compressed_oops(mut self, compressed: bool) -> Self {
        self.no_compressed_oops = !compressed;
        self
    }

    pub fn with_gc_threads(mut self, threads: usize) -> Self {
        self.gc_threads = threads;
        self
    }

    pub fn with_command(mut self, command: Command) -> Self {
        self.command = command;
        self
    }

    pub fn compressed_oops(&self) -> bool {
        !self.no_compressed_oops
    }

    pub fn runtime_heap_config(&self) -> RuntimeHeapConfig {
        RuntimeHeapConfig {
            heap_size: self.heap_size,
            region_size: self.region_size,
            compressed_oops: self.compressed_oops(),
            oop_shift: self.oop_shift,
            can_map: !self.no_map,
            can_load: true,
        }
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions::default()
            .with_verify(!self.skip_verify)
            .with_require_archive(self.require_archive)
            .with_workers(self.gc_threads)
            .with_verbose(self.verbose)
    }

    /// Encoding of the heap the demo graph is dumped from.
    pub fn dump_encoding(&self) -> OopEncoding {
        if self.compressed_oops() {
            let page = heapsnap_os::page_size() as u64;
            OopEncoding::Compressed(match self.oop_shift {
                Some(shift) => NarrowOopEncoding::heap_based(DUMP_HEAP_BASE, shift, page),
                None => NarrowOopEncoding::for_heap(
                    DUMP_HEAP_BASE,
                    DUMP_HEAP_BASE + self.heap_size as u64,
                    page,
                ),
            })
        } else {
            OopEncoding::Uncompressed
        }
    }
}
