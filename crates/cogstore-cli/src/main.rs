#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use cogstore_cache::{
    clear_cache, evict_files, Cache, CacheFileSystem, CacheParams, LocalFileSystem, SCHEME_PREFIX,
};
use cogstore_meta::MetadataManager;
use cogstore_store::{BlockStore, ChainReader, FileBlockStore, StoreHeader};
use cogstore_types::DEFAULT_BLOCK_SIZE;
use serde::Serialize;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "cogstore", about = "cogstore — persistent block cache toolkit")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Inspect a block cache file: header, free list, cached files.
    Info {
        /// Path to the cache file.
        cache_file: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Clear a block cache (deletes the backing file).
    Clear {
        /// Path to the cache file.
        cache_file: PathBuf,
    },
    /// Evict the listed source paths from a block cache.
    Evict {
        /// Path to the cache file.
        cache_file: PathBuf,
        /// Source paths to evict, including the scheme prefix.
        paths: Vec<String>,
    },
    /// Read a byte range from a local file through the cache and hex-dump it.
    Read {
        /// Path to the cache file (created if missing).
        cache_file: PathBuf,
        /// Local source file to read.
        source: PathBuf,
        /// Byte offset to start at.
        #[arg(long, default_value_t = 0)]
        offset: u64,
        /// Number of bytes to read.
        #[arg(long, default_value_t = 256)]
        len: usize,
        /// Block size when creating a fresh cache file.
        #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
        block_size: u64,
    },
}

// ── Reports ─────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct FileReport {
    path: String,
    file_size: u64,
    last_modified_micros: i64,
    cached_blocks: usize,
}

#[derive(Serialize)]
struct InfoReport {
    path: String,
    version: u32,
    block_size: u64,
    block_count: u64,
    meta_block: i64,
    free_blocks: usize,
    lru_depth: usize,
    files: Vec<FileReport>,
}

fn read_header(path: &PathBuf) -> Result<StoreHeader> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("opening cache file {}", path.display()))?;
    let mut bytes = [0_u8; StoreHeader::ENCODED_LEN];
    file.read_exact(&mut bytes)
        .with_context(|| format!("reading header of {}", path.display()))?;
    Ok(StoreHeader::decode(&bytes)?)
}

fn cmd_info(cache_file: &PathBuf, json: bool) -> Result<()> {
    let header = read_header(cache_file)?;

    // Load through the store layer without a coordinator so nothing is
    // flushed back: inspection leaves the file byte-identical.
    let mut store = FileBlockStore::new(header.block_size)?;
    store.load_existing(cache_file)?;

    let mut metadata = MetadataManager::new();
    if header.meta_block.is_valid() {
        let mut reader = ChainReader::new(&mut store, header.meta_block)?;
        metadata.read_from(&mut reader, header.version)?;
    }

    let report = InfoReport {
        path: cache_file.display().to_string(),
        version: header.version,
        block_size: header.block_size,
        block_count: header.block_count,
        meta_block: header.meta_block.0,
        free_blocks: store.free_list().len(),
        lru_depth: metadata.cached_block_count(),
        files: metadata
            .files()
            .map(|(path, md)| FileReport {
                path: path.to_owned(),
                file_size: md.file_size,
                last_modified_micros: md.last_modified.0,
                cached_blocks: md.blocks.len(),
            })
            .collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("cache file:   {}", report.path);
    println!("version:      {}", report.version);
    println!("block size:   {} bytes", report.block_size);
    println!("block count:  {}", report.block_count);
    println!("free blocks:  {}", report.free_blocks);
    println!("lru depth:    {}", report.lru_depth);
    println!("files:        {}", report.files.len());
    for file in &report.files {
        println!(
            "  {} ({} bytes, {} cached blocks, mtime {}us)",
            file.path, file.file_size, file.cached_blocks, file.last_modified_micros
        );
    }
    Ok(())
}

fn cmd_clear(cache_file: &PathBuf) -> Result<()> {
    let header = read_header(cache_file)?;
    let cache = Cache::new(header.block_size)?;
    let params = CacheParams {
        cache_path: cache_file.display().to_string(),
        ..CacheParams::default()
    };

    let success = clear_cache(&cache, &params);
    println!("Success: {success}");
    if !success {
        bail!("failed to clear {}", cache_file.display());
    }
    Ok(())
}

fn cmd_evict(cache_file: &PathBuf, paths: &[String]) -> Result<()> {
    let header = read_header(cache_file)?;
    let cache = Cache::new(header.block_size)?;
    cache.open(
        cache_file
            .to_str()
            .context("cache file path is not valid UTF-8")?,
    )?;

    let success = evict_files(&cache, paths);
    cache.close()?;
    println!("Success: {success}");
    if !success {
        bail!("failed to evict one or more paths");
    }
    Ok(())
}

fn cmd_read(
    cache_file: &PathBuf,
    source: &PathBuf,
    offset: u64,
    len: usize,
    block_size: u64,
) -> Result<()> {
    let block_size = if cache_file.exists() {
        read_header(cache_file)?.block_size
    } else {
        block_size
    };

    let cache = Arc::new(Cache::new(block_size)?);
    let cache_fs = CacheFileSystem::new(cache, Arc::new(LocalFileSystem));
    let params = CacheParams {
        cache_enabled: true,
        cache_path: cache_file.display().to_string(),
        ..CacheParams::default()
    };

    let path = format!("{SCHEME_PREFIX}{}", source.display());
    let mut handle = cache_fs.open(&path, &params)?;
    let mut buf = vec![0_u8; len];
    let got = handle.read_at(&mut buf, offset)?;
    handle.close()?;

    hex_dump(&buf[..got], offset);
    Ok(())
}

fn hex_dump(bytes: &[u8], base: u64) {
    for (row, chunk) in bytes.chunks(16).enumerate() {
        let offset = base + (row as u64) * 16;
        let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
        let ascii: String = chunk
            .iter()
            .map(|&b| if (0x20..0x7F).contains(&b) { b as char } else { '.' })
            .collect();
        println!("{offset:08x}  {:<47}  |{ascii}|", hex.join(" "));
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match &cli.command {
        Command::Info { cache_file, json } => cmd_info(cache_file, *json),
        Command::Clear { cache_file } => cmd_clear(cache_file),
        Command::Evict { cache_file, paths } => cmd_evict(cache_file, paths),
        Command::Read {
            cache_file,
            source,
            offset,
            len,
            block_size,
        } => cmd_read(cache_file, source, *offset, *len, *block_size),
    }
}
