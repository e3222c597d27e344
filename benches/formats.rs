use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use phoenix_rs::{ModuleOptions, Phoenix, Registry};
use std::fs;
use tempfile::TempDir;

fn png_chunk(kind: &[u8; 4], data: &[u8]) -> Vec<u8> {
    let mut out = (data.len() as u32).to_be_bytes().to_vec();
    out.extend_from_slice(kind);
    out.extend_from_slice(data);
    out.extend_from_slice(&crc32fast::hash(&[&kind[..], data].concat()).to_be_bytes());
    out
}

/// PNG with `chunks` IDAT chunks of 1 KiB each
fn sample_png(chunks: usize) -> Vec<u8> {
    let mut out = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    out.extend(png_chunk(b"IHDR", &[0, 0, 0, 16, 0, 0, 0, 16, 8, 2, 0, 0, 0]));
    for _ in 0..chunks {
        out.extend(png_chunk(b"IDAT", &[0x42; 1024]));
    }
    out.extend(png_chunk(b"IEND", &[]));
    out
}

fn boxed(kind: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
    out.extend_from_slice(kind);
    out.extend_from_slice(payload);
    out
}

/// ISO media file with `tracks` nested trak boxes
fn sample_mp4(tracks: usize) -> Vec<u8> {
    let mut moov = boxed(b"mvhd", &[0; 100]);
    for _ in 0..tracks {
        moov.extend(boxed(b"trak", &boxed(b"tkhd", &[0; 84])));
    }
    [boxed(b"ftyp", b"isom"), boxed(b"moov", &moov), boxed(b"mdat", &[0; 4096])].concat()
}

fn bench_parse(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let registry = Registry::builtin();
    let mut group = c.benchmark_group("parse");

    for (module, name, bytes) in [
        ("Network Graphics", "png_64", sample_png(64)),
        ("Network Graphics", "png_1024", sample_png(1024)),
        ("ISO Base Media Format/Quicktime", "mp4_64", sample_mp4(64)),
    ] {
        let path = dir.path().join(name);
        fs::write(&path, &bytes).unwrap();
        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_with_input(BenchmarkId::new(module, name), &path, |b, path| {
            let mut parser = registry.create(module, &ModuleOptions::default()).unwrap();
            b.iter(|| black_box(parser.parse(path).unwrap()));
        });
    }

    group.finish();
}

/// Full split into a fresh directory: parse, numbering, export and validity
fn bench_split(c: &mut Criterion) {
    let mut group = c.benchmark_group("split");
    group.sample_size(10);

    for chunks in [16usize, 256] {
        let bytes = sample_png(chunks);
        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(chunks), &bytes, |b, bytes| {
            b.iter_with_setup(
                || {
                    let dir = TempDir::new().unwrap();
                    let container = dir.path().join("in.png");
                    fs::write(&container, bytes).unwrap();
                    (dir, container)
                },
                |(dir, container)| {
                    let phoenix =
                        Phoenix::split(&container, dir.path().join("work"), "Network Graphics")
                            .unwrap();
                    black_box(phoenix.fragments().len());
                },
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_parse, bench_split);
criterion_main!(benches);
