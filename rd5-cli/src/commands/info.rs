use anyhow::{bail, Context, Result};
use rd5::filename::{filename_to_origin, origin_to_filename};
use rd5::ScratchBuffers;
use serde::Serialize;
use std::path::PathBuf;
use tracing::warn;

use super::{format_size, store_builder};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CellInfo {
    lon_degree: u32,
    lat_degree: u32,
    tiles: usize,
    nodes: usize,
    bytes: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegionInfo {
    path: String,
    name: String,
    origin_lon: i32,
    origin_lat: i32,
    divisor: u32,
    file_size: u64,
    total_nodes: usize,
    cells: Vec<CellInfo>,
}

pub fn run(section_cache_size: Option<u64>, region: PathBuf, json: bool) -> Result<()> {
    if !region.exists() {
        bail!("Region file not found: {}", region.display());
    }

    let store = store_builder(section_cache_size)
        .open(&region)
        .with_context(|| format!("Failed to open region: {}", region.display()))?;
    let (origin_lon, origin_lat) = store.origin();
    let name = origin_to_filename(origin_lon, origin_lat);

    let file_name = region
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    if let Some(named) = filename_to_origin(file_name) {
        if named != store.origin() {
            warn!(
                file = file_name,
                header = %name,
                "File name does not match the origin stored in the header"
            );
        }
    }

    let mut scratch = ScratchBuffers::new();
    let mut cells = Vec::new();
    for cell in store.populated_cells() {
        let section = store.section(cell)?;
        let mut nodes = 0;
        for tile in cell.tiles(store.divisor()) {
            if section.tile_bytes(tile).is_some() {
                nodes += section.materialize(tile, &mut scratch)?.size();
            }
        }
        cells.push(CellInfo {
            lon_degree: cell.lon_degree,
            lat_degree: cell.lat_degree,
            tiles: section.populated_tiles(),
            nodes,
            bytes: store.cell_len(cell),
        });
    }

    let info = RegionInfo {
        path: region.display().to_string(),
        name,
        origin_lon,
        origin_lat,
        divisor: store.divisor(),
        file_size: store.file_len() as u64,
        total_nodes: cells.iter().map(|c| c.nodes).sum(),
        cells,
    };

    if json {
        println!("{}", serde_json::to_string(&info)?);
        return Ok(());
    }

    let span = rd5::region::REGION_DEGREES as i32;
    println!("Region: {}", info.name);
    println!("Path: {}", info.path);
    println!(
        "Coverage: lon {} to {}, lat {} to {}",
        origin_lon,
        origin_lon + span,
        origin_lat,
        origin_lat + span
    );
    println!(
        "Divisor: {} ({} tiles per cell)",
        info.divisor,
        info.divisor * info.divisor
    );
    println!("File size: {}", format_size(info.file_size));
    println!(
        "Cells with data: {}/{}",
        info.cells.len(),
        rd5::region::CELL_COUNT
    );
    for cell in &info.cells {
        println!(
            "  cell ({}, {}): {} tiles, {} nodes, {}",
            cell.lon_degree,
            cell.lat_degree,
            cell.tiles,
            cell.nodes,
            format_size(cell.bytes as u64)
        );
    }
    println!("Total nodes: {}", info.total_nodes);

    Ok(())
}
