#![forbid(unsafe_code)]
//! Handle-level scenarios: read-through population, freshness validation,
//! passthrough mode, and reader-count gating, all against a mock underlying
//! file system that counts its I/O.

use cogstore_cache::{
    clear_cache, evict_files, Cache, CacheFileSystem, CacheParams, CachingFile, FileHandle,
    UnderlyingFile, UnderlyingFileSystem,
};
use cogstore_error::{CacheError, Result};
use cogstore_types::Timestamp;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;

const BLOCK_SIZE: u64 = 1024;

#[derive(Clone, Default)]
struct MockEntry {
    data: Vec<u8>,
    mtime: Timestamp,
    fail_open: bool,
}

#[derive(Default)]
struct MockState {
    files: HashMap<String, MockEntry>,
    data_reads: HashMap<String, usize>,
    opens: HashMap<String, usize>,
}

#[derive(Clone, Default)]
struct MockFs {
    state: Arc<Mutex<MockState>>,
}

impl MockFs {
    fn put(&self, path: &str, data: Vec<u8>, mtime: Timestamp) {
        self.state.lock().files.insert(
            path.to_owned(),
            MockEntry {
                data,
                mtime,
                fail_open: false,
            },
        );
    }

    fn set_mtime(&self, path: &str, mtime: Timestamp) {
        self.state
            .lock()
            .files
            .get_mut(path)
            .expect("known path")
            .mtime = mtime;
    }

    fn set_data(&self, path: &str, data: Vec<u8>) {
        self.state
            .lock()
            .files
            .get_mut(path)
            .expect("known path")
            .data = data;
    }

    fn fail_open(&self, path: &str) {
        self.state
            .lock()
            .files
            .get_mut(path)
            .expect("known path")
            .fail_open = true;
    }

    fn data_reads(&self, path: &str) -> usize {
        self.state
            .lock()
            .data_reads
            .get(path)
            .copied()
            .unwrap_or(0)
    }

    fn opens(&self, path: &str) -> usize {
        self.state.lock().opens.get(path).copied().unwrap_or(0)
    }
}

impl UnderlyingFileSystem for MockFs {
    fn open_read(&self, path: &str) -> Result<Box<dyn UnderlyingFile>> {
        let mut state = self.state.lock();
        *state.opens.entry(path.to_owned()).or_default() += 1;
        let entry = state
            .files
            .get(path)
            .ok_or_else(|| CacheError::Io(std::io::Error::from(std::io::ErrorKind::NotFound)))?;
        if entry.fail_open {
            return Err(CacheError::Io(std::io::Error::other("injected open failure")));
        }
        drop(state);
        Ok(Box::new(MockFile {
            state: Arc::clone(&self.state),
            path: path.to_owned(),
        }))
    }
}

struct MockFile {
    state: Arc<Mutex<MockState>>,
    path: String,
}

impl UnderlyingFile for MockFile {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut state = self.state.lock();
        *state.data_reads.entry(self.path.clone()).or_default() += 1;
        let data = &state.files.get(&self.path).expect("known path").data;
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn file_size(&mut self) -> Result<u64> {
        Ok(self.state.lock().files.get(&self.path).expect("known path").data.len() as u64)
    }

    fn last_modified(&mut self) -> Result<Timestamp> {
        Ok(self.state.lock().files.get(&self.path).expect("known path").mtime)
    }
}

struct Fixture {
    _dir: TempDir,
    fs: MockFs,
    cache_fs: CacheFileSystem,
    params: CacheParams,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().expect("tempdir");
    let fs = MockFs::default();
    let cache = Arc::new(Cache::new(BLOCK_SIZE).expect("cache"));
    let cache_fs = CacheFileSystem::new(cache, Arc::new(fs.clone()));
    let params = CacheParams {
        cache_enabled: true,
        cache_path: dir
            .path()
            .join("cache.bin")
            .to_str()
            .expect("utf-8 path")
            .to_owned(),
        ..CacheParams::default()
    };
    Fixture {
        _dir: dir,
        fs,
        cache_fs,
        params,
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn read_through_populates_then_serves_from_cache() {
    let fx = fixture();
    let content = pattern(3 * BLOCK_SIZE as usize + 117);
    fx.fs.put("data.bin", content.clone(), Timestamp(1_000_000));

    let mut handle = fx
        .cache_fs
        .open("cogstore://data.bin", &fx.params)
        .expect("open");

    let mut out = vec![0_u8; content.len()];
    assert_eq!(handle.read_at(&mut out, 0).expect("read"), content.len());
    assert_eq!(out, content);
    let populated_reads = fx.fs.data_reads("data.bin");
    assert!(populated_reads >= 4, "four blocks had to be fetched");

    // Second pass over the same range touches only the cache.
    let mut again = vec![0_u8; content.len()];
    assert_eq!(handle.read_at(&mut again, 0).expect("read"), content.len());
    assert_eq!(again, content);
    assert_eq!(fx.fs.data_reads("data.bin"), populated_reads);

    handle.close().expect("close");
}

#[test]
fn ranged_reads_cross_block_boundaries() {
    let fx = fixture();
    let content = pattern(5 * BLOCK_SIZE as usize);
    fx.fs.put("data.bin", content.clone(), Timestamp(1));

    let mut handle = fx
        .cache_fs
        .open("cogstore://data.bin", &fx.params)
        .expect("open");

    let start = BLOCK_SIZE as usize - 100;
    let len = 2 * BLOCK_SIZE as usize + 200;
    let mut out = vec![0_u8; len];
    assert_eq!(handle.read_at(&mut out, start as u64).expect("read"), len);
    assert_eq!(out, content[start..start + len]);
    handle.close().expect("close");
}

#[test]
fn reads_past_eof_are_clamped() {
    let fx = fixture();
    let content = pattern(500);
    fx.fs.put("data.bin", content.clone(), Timestamp(1));

    let mut handle = fx
        .cache_fs
        .open("cogstore://data.bin", &fx.params)
        .expect("open");

    let mut out = vec![0_u8; 2048];
    assert_eq!(handle.read_at(&mut out, 300).expect("read"), 200);
    assert_eq!(&out[..200], &content[300..]);
    assert_eq!(handle.read_at(&mut out, 500).expect("read at eof"), 0);
    assert_eq!(handle.read_at(&mut out, 9999).expect("read past eof"), 0);
    handle.close().expect("close");
}

#[test]
fn cursor_reads_advance_sequentially() {
    let fx = fixture();
    let content = pattern(2 * BLOCK_SIZE as usize + 50);
    fx.fs.put("data.bin", content.clone(), Timestamp(1));

    let handle = fx
        .cache_fs
        .open("cogstore://data.bin", &fx.params)
        .expect("open");
    let FileHandle::Cached(mut handle) = handle else {
        panic!("expected a caching handle");
    };

    let mut collected = Vec::new();
    let mut chunk = vec![0_u8; 300];
    loop {
        let n = handle.read(&mut chunk).expect("read");
        if n == 0 {
            break;
        }
        collected.extend_from_slice(&chunk[..n]);
    }
    assert_eq!(collected, content);
    assert_eq!(handle.position(), content.len() as u64);

    handle.seek(BLOCK_SIZE);
    let n = handle.read(&mut chunk).expect("read after seek");
    assert_eq!(&chunk[..n], &content[BLOCK_SIZE as usize..BLOCK_SIZE as usize + n]);
    handle.close().expect("close");
}

#[test]
fn disabled_cache_passes_through() {
    let fx = fixture();
    fx.fs.put("data.bin", pattern(100), Timestamp(1));
    let params = CacheParams {
        cache_enabled: false,
        ..fx.params.clone()
    };

    let mut handle = fx
        .cache_fs
        .open("cogstore://data.bin", &params)
        .expect("open");
    assert!(matches!(handle, FileHandle::Direct(_)));

    let mut out = vec![0_u8; 100];
    assert_eq!(handle.read_at(&mut out, 0).expect("read"), 100);
    assert!(!fx.cache_fs.cache().is_open());
    handle.close().expect("close");
}

#[test]
fn clear_is_refused_while_a_handle_is_open() {
    let fx = fixture();
    fx.fs.put("data.bin", pattern(100), Timestamp(1));

    let mut handle = fx
        .cache_fs
        .open("cogstore://data.bin", &fx.params)
        .expect("open");

    let cache = fx.cache_fs.cache();
    assert!(cache.clear().unwrap_err().is_busy());
    assert!(!clear_cache(cache, &fx.params));

    handle.close().expect("close");
    cache.clear().expect("clear after close");
    assert!(!std::path::Path::new(&fx.params.cache_path).exists());
}

#[test]
fn mtime_change_invalidates_cached_blocks() {
    let fx = fixture();
    let content = pattern(500);
    fx.fs.put("data.bin", content.clone(), Timestamp(1_000_000));

    let mut handle = fx
        .cache_fs
        .open("cogstore://data.bin", &fx.params)
        .expect("open");
    let mut out = vec![0_u8; 500];
    handle.read_at(&mut out, 0).expect("read");
    handle.close().expect("close");
    let reads_after_population = fx.fs.data_reads("data.bin");

    // Unchanged source: the reopened handle serves from the cache.
    let mut handle = fx
        .cache_fs
        .open("cogstore://data.bin", &fx.params)
        .expect("reopen");
    handle.read_at(&mut out, 0).expect("read");
    handle.close().expect("close");
    assert_eq!(fx.fs.data_reads("data.bin"), reads_after_population);

    // Touch the source; the next open evicts and the read refetches.
    fx.fs.set_mtime("data.bin", Timestamp(2_000_000));
    let mut handle = fx
        .cache_fs
        .open("cogstore://data.bin", &fx.params)
        .expect("reopen after touch");
    let metadata = fx
        .cache_fs
        .cache()
        .retrieve_file_metadata("cogstore://data.bin")
        .expect("repopulated entry");
    assert_eq!(metadata.last_modified, Timestamp(2_000_000));
    assert!(metadata.blocks.is_empty());

    handle.read_at(&mut out, 0).expect("read");
    assert_eq!(out, content);
    assert_eq!(fx.fs.data_reads("data.bin"), reads_after_population + 1);
    handle.close().expect("close");
}

#[test]
fn immutable_sources_skip_the_freshness_check() {
    let fx = fixture();
    fx.fs.put("data.bin", pattern(500), Timestamp(1_000_000));
    let params = CacheParams {
        data_mutable: false,
        ..fx.params.clone()
    };

    let mut handle = fx
        .cache_fs
        .open("cogstore://data.bin", &params)
        .expect("open");
    let mut out = vec![0_u8; 500];
    handle.read_at(&mut out, 0).expect("read");
    handle.close().expect("close");
    let populated = fx.fs.data_reads("data.bin");

    fx.fs.set_mtime("data.bin", Timestamp(9_000_000));
    let mut handle = fx
        .cache_fs
        .open("cogstore://data.bin", &params)
        .expect("reopen");
    handle.read_at(&mut out, 0).expect("read");
    handle.close().expect("close");
    assert_eq!(fx.fs.data_reads("data.bin"), populated);
}

#[test]
fn size_change_invalidates_when_mtime_is_unknown() {
    let fx = fixture();
    fx.fs.put("data.bin", pattern(500), Timestamp::UNKNOWN);

    let mut handle = fx
        .cache_fs
        .open("cogstore://data.bin", &fx.params)
        .expect("open");
    let mut out = vec![0_u8; 500];
    handle.read_at(&mut out, 0).expect("read");
    handle.close().expect("close");
    let populated = fx.fs.data_reads("data.bin");

    fx.fs.set_data("data.bin", pattern(700));
    let mut handle = fx
        .cache_fs
        .open("cogstore://data.bin", &fx.params)
        .expect("reopen");
    let metadata = fx
        .cache_fs
        .cache()
        .retrieve_file_metadata("cogstore://data.bin")
        .expect("entry");
    assert_eq!(metadata.file_size, 700);
    assert!(metadata.blocks.is_empty());
    let mut bigger = vec![0_u8; 700];
    handle.read_at(&mut bigger, 0).expect("read");
    assert!(fx.fs.data_reads("data.bin") > populated);
    handle.close().expect("close");
}

#[test]
fn failed_handle_construction_releases_the_reader_count() {
    let fx = fixture();
    fx.fs.put("data.bin", pattern(100), Timestamp(1));
    fx.fs.fail_open("data.bin");

    let err = fx
        .cache_fs
        .open("cogstore://data.bin", &fx.params)
        .unwrap_err();
    assert!(matches!(err, CacheError::Io(_)));

    let cache = fx.cache_fs.cache();
    assert_eq!(cache.active_readers(), 0);
    cache.close().expect("close despite failed construction");
}

#[test]
fn metadata_getters_are_served_from_the_cache() {
    let fx = fixture();
    fx.fs.put("data.bin", pattern(321), Timestamp(5_000_000));

    let cache = Arc::clone(fx.cache_fs.cache());
    cache.open(&fx.params.cache_path).expect("open cache");
    let mut handle = CachingFile::open(
        Arc::clone(&cache),
        Arc::new(fx.fs.clone()),
        "cogstore://data.bin",
        true,
    )
    .expect("open handle");

    let opens_after_construction = fx.fs.opens("data.bin");
    assert_eq!(handle.file_size().expect("size"), 321);
    assert_eq!(handle.last_modified().expect("mtime"), Timestamp(5_000_000));
    // Both answers came from cached metadata, not new underlying opens.
    assert_eq!(fx.fs.opens("data.bin"), opens_after_construction);
    handle.close().expect("close");
}

#[test]
fn evict_files_management_call_drops_listed_paths() {
    let fx = fixture();
    fx.fs.put("a.bin", pattern(100), Timestamp(1));
    fx.fs.put("b.bin", pattern(100), Timestamp(1));

    for name in ["a.bin", "b.bin"] {
        let mut handle = fx
            .cache_fs
            .open(&format!("cogstore://{name}"), &fx.params)
            .expect("open");
        let mut out = vec![0_u8; 100];
        handle.read_at(&mut out, 0).expect("read");
        handle.close().expect("close");
    }

    let cache = fx.cache_fs.cache();
    assert!(evict_files(cache, &["cogstore://a.bin"]));
    assert!(cache
        .retrieve_file_metadata("cogstore://a.bin")
        .is_none());
    assert!(cache
        .retrieve_file_metadata("cogstore://b.bin")
        .is_some());

    // An empty list is permitted.
    assert!(evict_files(cache, &Vec::<String>::new()));
}
