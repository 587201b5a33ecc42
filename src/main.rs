/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */
use heapsnap::demo::{self, DemoGraph, DUMP_HEAP_BASE};
use heapsnap::dump::{dump_archive, HeapDump};
use heapsnap::options::Command;
use heapsnap::prelude::*;
use std::error::Error;
use std::process;
use structopt::StructOpt;

type CliResult = std::result::Result<(), Box<dyn Error>>;

fn dump(options: &Options, nodes: usize) -> CliResult {
    let graph = DemoGraph::build(options.dump_encoding(), DUMP_HEAP_BASE, options.heap_size, nodes)?;
    let config = DumpConfig::default()
        .with_heap_region_alignment(options.region_size)
        .with_verbose(options.verbose);
    let metadata = DemoGraph::metadata(config.core_region_alignment as u64);
    let header = dump_archive(
        &options.archive,
        &config,
        Some(HeapDump {
            heap: &graph.heap,
            selection: &graph.selection,
            relocator: &graph.relocator,
        }),
        metadata,
    )?;
    println!(
        "archived {} objects ({} bytes of heap) to {}",
        graph.selection.open.len() + graph.selection.closed.len(),
        header.region(RegionIndex::Heap).used,
        options.archive.display()
    );
    Ok(())
}

fn run(options: &Options, nodes: usize) -> CliResult {
    let oop_size = if options.compressed_oops() { 4 } else { 8 };
    let (klasses, node_klass) = demo::demo_klasses(oop_size);
    let mut heap = RuntimeHeap::new(klasses, &options.runtime_heap_config())?;
    let load = options.load_options();
    let require = load.require_archive;

    let opened = FileMapInfo::open(&options.archive, ArchiveKind::Static, &load.vm_ident, load.verify);
    let mut info = match opened {
        Ok(info) => info,
        Err(e) if !require => {
            println!("running without archive: {}", e);
            return Ok(());
        }
        Err(e) => return Err(e.escalate(true).into()),
    };
    let loader = ArchiveHeapLoader::new(load);
    match loader.map_or_load(&mut info, &mut heap) {
        Ok(loaded) => {
            let metadata = loaded.metadata().map(|core| core.base());
            demo::verify_demo(&heap, &loaded, nodes, node_klass, metadata)?;
            println!(
                "{:?} {} bytes at {:#x} ({:?}, {} references, {} metadata pointers patched)",
                loaded.mode,
                loaded.byte_size,
                loaded.start,
                loaded.patch,
                loaded.patched_oops,
                loaded.patched_natives
            );
            Ok(())
        }
        Err(e) if e.is_recoverable() => {
            println!("running without archived heap: {}", e);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn print_header(options: &Options) -> CliResult {
    let header = FileMapInfo::read_header(&options.archive)?;
    let mut out = String::new();
    header.print(&mut out)?;
    print!("{}", out);
    Ok(())
}

fn verify(options: &Options) -> CliResult {
    let header = FileMapInfo::read_header(&options.archive)?;
    let kind = header
        .kind()
        .ok_or_else(|| format!("unknown magic {:#x}", header.generic.magic))?;
    let info = FileMapInfo::open(&options.archive, kind, &header.vm_ident(), true)?;
    for index in RegionIndex::ALL.iter().copied() {
        if info.region(index).has_contents() {
            info.read_region(index)?;
            println!("{}: ok", index);
        }
    }
    Ok(())
}

fn main() {
    let options = Options::from_args();
    let filter = if options.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let result = match options.command {
        Command::Dump { nodes } => dump(&options, nodes),
        Command::Run { nodes } => run(&options, nodes),
        Command::PrintHeader => print_header(&options),
        Command::Verify => verify(&options),
    };
    if let Err(e) = result {
        eprintln!("heapsnap: {}", e);
        process::exit(1);
    }
}
