use layerfs::blockdev::{FileBackedBlockDevice, BLOCK_SIZE};
use layerfs::prelude::*;
use layerfs::{Error, FileKind};
use std::sync::Arc;
use tempfile::TempDir;

fn setup() -> Engine {
    env_logger::builder().is_test(true).try_init().ok();
    Engine::new(EngineConfig::default()).unwrap()
}

fn caller() -> Caller {
    Caller::new(1000, 1000)
}

fn create_file(engine: &Engine, parent: Handle, name: &str) -> (Handle, u64) {
    let (attrs, fh) = engine
        .create(parent, name, 0o644, libc::O_RDWR, caller())
        .unwrap();
    (attrs.handle, fh)
}

fn read_all(engine: &Engine, handle: Handle) -> Vec<u8> {
    let size = engine.getattr(handle).unwrap().size;
    let fh = engine.open(handle, libc::O_RDONLY).unwrap();
    let data = engine.read(handle, fh, 0, size as u32).unwrap();
    engine.release(handle, fh).unwrap();
    data
}

#[test]
fn test_create_write_read_hello() {
    let engine = setup();
    let a = engine.mkdir(Handle::ROOT, "a", 0o755, caller()).unwrap();
    let (f, fh) = create_file(&engine, a.handle, "f");
    assert_eq!(engine.write(f, fh, 0, b"hello").unwrap(), 5);
    engine.release(f, fh).unwrap();

    let found = engine.lookup_path("/a/f").unwrap();
    assert_eq!(found.handle, f);
    assert_eq!(found.kind, FileKind::RegularFile);
    assert_eq!(read_all(&engine, f), b"hello");
}

#[test]
fn test_overlapping_writes() {
    let engine = setup();
    let (f, fh) = create_file(&engine, Handle::ROOT, "f");
    engine.write(f, fh, 0, b"0123456789").unwrap();
    engine.write(f, fh, 3, b"abcde").unwrap();

    let data = engine.read(f, fh, 0, 10).unwrap();
    assert_eq!(data, b"012abcde89");
    assert_eq!(engine.getattr(f).unwrap().size, 10);
    engine.release(f, fh).unwrap();
}

#[test]
fn test_sparse_write_reads_zero_fill() {
    let engine = setup();
    let (f, fh) = create_file(&engine, Handle::ROOT, "sparse");
    let far = 3 * BLOCK_SIZE as u64 + 100;
    engine.write(f, fh, 10, b"head").unwrap();
    engine.write(f, fh, far, b"tail").unwrap();

    let data = engine.read(f, fh, 0, (far + 4) as u32).unwrap();
    assert_eq!(data.len() as u64, far + 4);
    assert_eq!(&data[10..14], b"head");
    assert!(data[14..far as usize].iter().all(|b| *b == 0));
    assert_eq!(&data[far as usize..], b"tail");

    // Only the two touched pages are allocated
    assert_eq!(engine.used_blocks(), 2);
    engine.release(f, fh).unwrap();
}

#[test]
fn test_write_across_page_boundary() {
    let engine = setup();
    let (f, fh) = create_file(&engine, Handle::ROOT, "span");
    let data: Vec<u8> = (0..BLOCK_SIZE + 512).map(|i| (i % 251) as u8).collect();
    engine.write(f, fh, BLOCK_SIZE as u64 - 256, &data).unwrap();

    let back = engine
        .read(f, fh, BLOCK_SIZE as u64 - 256, data.len() as u32)
        .unwrap();
    assert_eq!(back, data);
    engine.release(f, fh).unwrap();
}

#[test]
fn test_truncate_then_extend_zero_fills() {
    let engine = setup();
    let (f, fh) = create_file(&engine, Handle::ROOT, "t");
    let original = vec![0xAAu8; BLOCK_SIZE * 2];
    engine.write(f, fh, 0, &original).unwrap();

    let shrink = SetAttr {
        size: Some(100),
        ..Default::default()
    };
    engine.setattr(f, &shrink).unwrap();
    let grow = SetAttr {
        size: Some(original.len() as u64),
        ..Default::default()
    };
    assert_eq!(engine.setattr(f, &grow).unwrap().size, original.len() as u64);

    let data = engine.read(f, fh, 0, original.len() as u32).unwrap();
    assert!(data[..100].iter().all(|b| *b == 0xAA));
    assert!(data[100..].iter().all(|b| *b == 0));
    engine.release(f, fh).unwrap();
}

#[test]
fn test_rmdir_link_counts() {
    let engine = setup();
    let a = engine.mkdir(Handle::ROOT, "a", 0o755, caller()).unwrap();
    engine.mkdir(a.handle, "b", 0o755, caller()).unwrap();
    assert_eq!(engine.getattr(a.handle).unwrap().nlink, 3);

    engine.rmdir(a.handle, "b").unwrap();
    assert_eq!(engine.getattr(a.handle).unwrap().nlink, 2);
    assert!(matches!(engine.lookup(a.handle, "b"), Err(Error::NotFound)));

    let c = engine.mkdir(a.handle, "c", 0o755, caller()).unwrap();
    engine.mkdir(c.handle, "nested", 0o755, caller()).unwrap();
    assert!(matches!(engine.rmdir(a.handle, "c"), Err(Error::NotEmpty)));
    assert!(engine.lookup(a.handle, "c").is_ok());
}

#[test]
fn test_rmdir_nested_content_relaxed() {
    env_logger::builder().is_test(true).try_init().ok();
    let config = EngineConfig {
        relaxed_rmdir: true,
        ..Default::default()
    };
    let engine = Engine::new(config).unwrap();
    let a = engine.mkdir(Handle::ROOT, "a", 0o755, caller()).unwrap();
    let c = engine.mkdir(a.handle, "c", 0o755, caller()).unwrap();
    engine.mkdir(c.handle, "nested", 0o755, caller()).unwrap();

    assert!(matches!(engine.rmdir(a.handle, "c"), Err(Error::NotEmpty)));
}

#[test]
fn test_rename_across_directories() {
    let engine = setup();
    let a = engine.mkdir(Handle::ROOT, "a", 0o755, caller()).unwrap();
    let b = engine.mkdir(Handle::ROOT, "b", 0o755, caller()).unwrap();
    assert!(a.handle.ino() < b.handle.ino());
    let (f, fh) = create_file(&engine, a.handle, "f");
    engine.write(f, fh, 0, b"moved").unwrap();
    engine.release(f, fh).unwrap();

    engine.rename(a.handle, "f", b.handle, "g").unwrap();
    assert!(matches!(engine.lookup(a.handle, "f"), Err(Error::NotFound)));
    let g = engine.lookup(b.handle, "g").unwrap();
    assert_eq!(g.handle, f);
    assert_eq!(read_all(&engine, g.handle), b"moved");

    let fh = engine.opendir(b.handle, libc::O_RDONLY).unwrap();
    let names: Vec<_> = engine
        .readdir(b.handle, fh, 0)
        .unwrap()
        .into_iter()
        .map(|entry| entry.name)
        .collect();
    assert_eq!(names, vec!["g".to_string()]);
    engine.releasedir(b.handle, fh).unwrap();
}

#[test]
fn test_unlinked_file_readable_until_release() {
    let engine = setup();
    let (f, fh) = create_file(&engine, Handle::ROOT, "f");
    engine.write(f, fh, 0, b"still here").unwrap();
    engine.unlink(Handle::ROOT, "f").unwrap();

    assert!(matches!(engine.lookup(Handle::ROOT, "f"), Err(Error::NotFound)));
    assert_eq!(engine.read(f, fh, 0, 64).unwrap(), b"still here");
    assert_eq!(engine.getattr(f).unwrap().nlink, 0);

    engine.release(f, fh).unwrap();
    assert!(matches!(engine.getattr(f), Err(Error::NotFound)));
    assert_eq!(engine.used_blocks(), 0);
}

#[test]
fn test_hard_link_shares_content() {
    let engine = setup();
    let d = engine.mkdir(Handle::ROOT, "d", 0o755, caller()).unwrap();
    let (f, fh) = create_file(&engine, Handle::ROOT, "f");
    engine.write(f, fh, 0, b"shared").unwrap();
    engine.release(f, fh).unwrap();

    let linked = engine.link(f, d.handle, "alias").unwrap();
    assert_eq!(linked.handle, f);
    assert_eq!(linked.nlink, 2);

    engine.unlink(Handle::ROOT, "f").unwrap();
    let alias = engine.lookup(d.handle, "alias").unwrap();
    assert_eq!(alias.nlink, 1);
    assert_eq!(read_all(&engine, alias.handle), b"shared");
}

#[test]
fn test_file_backed_capacity() {
    env_logger::builder().is_test(true).try_init().ok();
    let dir = TempDir::new().unwrap();
    let device = FileBackedBlockDevice::create(dir.path().join("layerfs.img"), 4 * BLOCK_SIZE as u64)
        .unwrap();
    let engine = Engine::with_device(EngineConfig::default(), Arc::new(device)).unwrap();

    let st = engine.statfs();
    assert_eq!(st.blocks, 4);
    assert_eq!(st.bsize, BLOCK_SIZE as u32);

    let (f, fh) = create_file(&engine, Handle::ROOT, "big");
    engine.write(f, fh, 0, &vec![1u8; 3 * BLOCK_SIZE]).unwrap();
    assert_eq!(engine.statfs().bfree, 1);
    assert!(matches!(
        engine.write(f, fh, 3 * BLOCK_SIZE as u64, &vec![2u8; 2 * BLOCK_SIZE]),
        Err(Error::ResourceExhausted(_))
    ));
    engine.fsync(f, fh, false).unwrap();
    engine.release(f, fh).unwrap();

    engine.unlink(Handle::ROOT, "big").unwrap();
    assert_eq!(engine.statfs().bfree, 4);
    engine.shutdown().unwrap();
}

#[test]
fn test_directory_errors() {
    let engine = setup();
    let (f, fh) = create_file(&engine, Handle::ROOT, "f");
    engine.release(f, fh).unwrap();

    assert!(matches!(
        engine.mkdir(f, "sub", 0o755, caller()),
        Err(Error::NotADirectory)
    ));
    assert!(matches!(engine.lookup(f, "x"), Err(Error::NotADirectory)));
    assert!(matches!(engine.open(Handle::ROOT, libc::O_RDONLY), Err(Error::IsADirectory)));
    assert!(matches!(engine.opendir(f, libc::O_RDONLY), Err(Error::NotADirectory)));
    assert!(matches!(engine.rmdir(Handle::ROOT, "missing"), Err(Error::NotFound)));
    assert_eq!(Error::NotFound.errno(), libc::ENOENT);
}
