use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rd5::{
    DiffConfig, DiffEngine, Link, Node, NodeId, Raster, RasterHeader, RegionAddress, RegionStore,
    RegionWriter, Sample, ScratchBuffers, TileAddress, TileCache,
};
use tempfile::TempDir;

const DIVISOR: u32 = 32;

/// A tile with a grid of nodes linked to their east neighbour.
fn create_tile(tile: TileAddress, elevation_offset: i16) -> TileCache {
    let origin = tile.origin(DIVISOR);
    let mut nodes = Vec::new();
    for i in 0..20u32 {
        for j in 0..20u32 {
            let id = NodeId::new(origin.ilon + i * 1000, origin.ilat + j * 1000);
            let mut node = Node::new(id, ((i + j) % 400) as i16 + elevation_offset);
            node.links.push(Link {
                target: NodeId::new(id.ilon + 1000, id.ilat),
                tags: if j % 2 == 0 {
                    b"highway=residential".to_vec()
                } else {
                    b"highway=service".to_vec()
                },
                geometry: Vec::new(),
            });
            nodes.push(node);
        }
    }
    TileCache::from_nodes(tile, DIVISOR, nodes)
}

fn bench_tile_encode(c: &mut Criterion) {
    let cache = create_tile(TileAddress::new(3, 4), 0);
    let mut scratch = ScratchBuffers::with_capacity(1 << 20);

    c.bench_function("tile_encode_400_nodes", |b| {
        b.iter(|| black_box(cache.encode(&mut scratch).unwrap()));
    });
}

fn bench_tile_decode(c: &mut Criterion) {
    let cache = create_tile(TileAddress::new(3, 4), 0);
    let mut scratch = ScratchBuffers::with_capacity(1 << 20);
    let len = cache.encode(&mut scratch).unwrap();
    let bytes = scratch.encoded(len).to_vec();

    c.bench_function("tile_decode_400_nodes", |b| {
        b.iter(|| {
            black_box(
                TileCache::decode(black_box(&bytes), &mut scratch, cache.address(), DIVISOR)
                    .unwrap(),
            )
        });
    });
}

fn bench_raster_roundtrip(c: &mut Criterion) {
    let header = RasterHeader {
        ncols: 600,
        nrows: 600,
        xll_corner: 5.0,
        yll_corner: 45.0,
        cell_size: 1.0 / 1200.0,
    };
    let values = (0..600 * 600)
        .map(|i| Sample::Value(((i % 600 + i / 600) % 3000) as f64))
        .collect();
    let raster = Raster::new(header, values).unwrap();

    c.bench_function("raster_encode_360k", |b| {
        b.iter(|| black_box(raster.to_bytes().unwrap()));
    });

    let bytes = raster.to_bytes().unwrap();
    c.bench_function("raster_decode_360k", |b| {
        b.iter(|| black_box(Raster::from_bytes(&bytes).unwrap()));
    });
}

fn bench_region_diff(c: &mut Criterion) {
    let tmp = TempDir::new().unwrap();
    let mut scratch = ScratchBuffers::with_capacity(1 << 20);

    let mut write = |name: &str, offset: i16| {
        let mut writer = RegionWriter::new(DIVISOR, (5, 45)).unwrap();
        for tile in RegionAddress::new(1, 1).tiles(DIVISOR).step_by(7) {
            writer
                .insert(&create_tile(tile, offset), &mut scratch)
                .unwrap();
        }
        let path = tmp.path().join(name);
        writer.write(&path).unwrap();
        RegionStore::open(&path).unwrap()
    };
    let older = write("old.rd5", 0);
    let newer = write("new.rd5", 1);

    let engine = DiffEngine::new(DiffConfig::new().scratch_capacity(1 << 20));
    c.bench_function("region_diff_one_cell", |b| {
        b.iter(|| black_box(engine.diff(&older, &newer).unwrap()));
    });
}

criterion_group!(
    benches,
    bench_tile_encode,
    bench_tile_decode,
    bench_raster_roundtrip,
    bench_region_diff
);
criterion_main!(benches);
