use criterion::{black_box, criterion_group, criterion_main, Criterion};
use layerfs::blockdev::BLOCK_SIZE;
use layerfs::prelude::*;

fn caller() -> Caller {
    Caller::new(1000, 1000)
}

fn benchmark_file_operations(c: &mut Criterion) {
    let engine = Engine::new(EngineConfig::default()).unwrap();
    let (attrs, fh) = engine
        .create(Handle::ROOT, "bench", 0o644, libc::O_RDWR, caller())
        .unwrap();
    let file = attrs.handle;

    c.bench_function("write_4kb", |b| {
        let data = vec![0u8; BLOCK_SIZE];
        b.iter(|| engine.write(file, fh, 0, black_box(&data)).unwrap());
    });

    engine.write(file, fh, 0, &vec![42u8; 64 * 1024]).unwrap();
    c.bench_function("read_64kb", |b| {
        b.iter(|| black_box(engine.read(file, fh, 0, 64 * 1024).unwrap()));
    });
    engine.release(file, fh).unwrap();

    c.bench_function("create_unlink", |b| {
        b.iter(|| {
            let (attrs, fh) = engine
                .create(Handle::ROOT, "tmp", 0o644, libc::O_WRONLY, caller())
                .unwrap();
            engine.release(attrs.handle, fh).unwrap();
            engine.unlink(Handle::ROOT, "tmp").unwrap();
        });
    });
}

fn benchmark_clone_operations(c: &mut Criterion) {
    let engine = Engine::new(EngineConfig::default()).unwrap();
    let src = engine.mkdir(Handle::ROOT, "src", 0o755, caller()).unwrap().handle;
    for i in 0..256 {
        let (attrs, fh) = engine
            .create(src, &format!("file{i}"), 0o644, libc::O_WRONLY, caller())
            .unwrap();
        engine.write(attrs.handle, fh, 0, &[i as u8; 512]).unwrap();
        engine.release(attrs.handle, fh).unwrap();
    }

    c.bench_function("clone_remove_256_entries", |b| {
        b.iter(|| {
            let root = engine.new_clone(src, "snap").unwrap();
            engine.remove_clone(black_box(root)).unwrap();
        });
    });

    c.bench_function("copy_up_first_write", |b| {
        b.iter(|| {
            let root = engine.new_clone(src, "snap").unwrap();
            let file = engine.lookup(root, "file0").unwrap().handle;
            let fh = engine.open(file, libc::O_WRONLY).unwrap();
            engine.write(file, fh, 0, b"x").unwrap();
            engine.release(file, fh).unwrap();
            engine.remove_clone(root).unwrap();
        });
    });
}

criterion_group!(benches, benchmark_file_operations, benchmark_clone_operations);
criterion_main!(benches);
