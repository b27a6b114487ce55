//! Basic example: summarize a region file and diff it against another one.
//!
//! Run with: cargo run --example basic -- old/E5_N45.rd5 [new/E5_N45.rd5]

use rd5::{DiffConfig, DiffEngine, Rd5Error, RegionStore, ScratchBuffers};
use std::env;

fn main() -> Result<(), Rd5Error> {
    let mut args = env::args().skip(1);
    let path = args.next().unwrap_or_else(|| {
        eprintln!("Usage: cargo run --example basic -- <region.rd5> [other.rd5]");
        std::process::exit(1);
    });

    let store = RegionStore::open(&path)?;
    let (lon, lat) = store.origin();
    println!("Region {} at lon {} lat {}", path, lon, lat);
    println!("  Divisor: {}", store.divisor());
    println!("{:-<50}", "");

    let mut scratch = ScratchBuffers::new();
    for cell in store.populated_cells() {
        let section = store.section(cell)?;
        let mut nodes = 0;
        for tile in cell.tiles(store.divisor()) {
            nodes += section.materialize(tile, &mut scratch)?.size();
        }
        println!(
            "  cell ({}, {}): {} tiles, {} nodes",
            cell.lon_degree,
            cell.lat_degree,
            section.populated_tiles(),
            nodes
        );
    }

    if let Some(other) = args.next() {
        let newer = RegionStore::open(&other)?;
        let stats = DiffEngine::new(DiffConfig::default()).diff(&store, &newer)?;
        println!(
            "\nnodesTotal={} nodesDiff={} bytesDiff={}",
            stats.total_nodes, stats.diff_nodes, stats.diff_bytes
        );
    }

    Ok(())
}
