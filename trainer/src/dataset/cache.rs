//! Binary cache of a labeled corpus.
//!
//! Layout (little endian, zstd compressed as a whole):
//! magic `EVDS`, format version (u32), feature count (u32), rows (u64),
//! provenance as length-prefixed TOML, then per row the 12 packed feature
//! words (u64) followed by the label (f32).

use super::{Corpus, LabeledExample, Provenance};
use crate::atomic::write_atomically;
use crate::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
use nn::feature_set::{FeatureVector, NUM_FEATURES, NUM_WORDS};
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

const MAGIC: &[u8; 4] = b"EVDS";
const CACHE_VERSION: u32 = 1;
const COMPRESSION_LEVEL: i32 = 3;

fn write_corpus(corpus: &Corpus, write: &mut dyn Write) -> io::Result<()> {
    let provenance = toml::to_string(&corpus.provenance)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    write.write_all(MAGIC)?;
    write.write_u32::<LittleEndian>(CACHE_VERSION)?;
    write.write_u32::<LittleEndian>(NUM_FEATURES as u32)?;
    write.write_u64::<LittleEndian>(corpus.examples.len() as u64)?;
    write.write_u32::<LittleEndian>(provenance.len() as u32)?;
    write.write_all(provenance.as_bytes())?;

    for example in &corpus.examples {
        for &word in example.features.words() {
            write.write_u64::<LittleEndian>(word)?;
        }
        write.write_f32::<LittleEndian>(example.label)?;
    }

    Ok(())
}

/// Stores the corpus in a single compressed file. Either the whole file is written or nothing is
pub fn save_cache(corpus: &Corpus, path: &Path) -> Result<()> {
    write_atomically(path, |writer| {
        let mut encoder = zstd::Encoder::new(writer, COMPRESSION_LEVEL)?;
        write_corpus(corpus, &mut encoder)?;
        encoder.finish()?;
        Ok(())
    })?;

    debug!("wrote {} positions to {}", corpus.len(), path.display());
    Ok(())
}

fn format_error(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::UnexpectedEof => Error::CacheFormat("truncated file".to_string()),
        _ => Error::CacheFormat(e.to_string()),
    }
}

fn read_corpus(read: &mut dyn Read) -> Result<Corpus> {
    let mut magic = [0u8; 4];
    read.read_exact(&mut magic).map_err(format_error)?;
    if &magic != MAGIC {
        return Err(Error::CacheFormat("not a dataset cache".to_string()));
    }

    let version = read.read_u32::<LittleEndian>().map_err(format_error)?;
    if version != CACHE_VERSION {
        return Err(Error::CacheFormat(format!(
            "format version {} (expected {})",
            version, CACHE_VERSION
        )));
    }

    let features = read.read_u32::<LittleEndian>().map_err(format_error)?;
    if features as usize != NUM_FEATURES {
        return Err(Error::CacheFormat(format!(
            "{} features per position (expected {})",
            features, NUM_FEATURES
        )));
    }

    let rows = read.read_u64::<LittleEndian>().map_err(format_error)?;

    let provenance_len = read.read_u32::<LittleEndian>().map_err(format_error)? as usize;
    let mut provenance = Vec::new();
    Read::take(&mut *read, provenance_len as u64)
        .read_to_end(&mut provenance)
        .map_err(format_error)?;
    if provenance.len() != provenance_len {
        return Err(Error::CacheFormat("truncated file".to_string()));
    }
    let provenance: Provenance = std::str::from_utf8(&provenance)
        .map_err(|e| Error::CacheFormat(e.to_string()))
        .and_then(|s| toml::from_str(s).map_err(|e| Error::CacheFormat(e.to_string())))?;

    // the row count is untrusted, let the vector grow as rows are read
    let mut examples = Vec::with_capacity(rows.min(1 << 20) as usize);
    for row in 0..rows {
        let mut words = [0u64; NUM_WORDS];
        read.read_u64_into::<LittleEndian>(&mut words).map_err(format_error)?;
        let label = read.read_f32::<LittleEndian>().map_err(format_error)?;

        if !(-1.0..=1.0).contains(&label) {
            return Err(Error::CacheFormat(format!("label {} out of range at row {}", label, row)));
        }
        examples.push(LabeledExample {
            features: FeatureVector::from_words(words),
            label,
        });
    }

    let mut extra = [0u8; 1];
    match read.read(&mut extra) {
        Ok(0) => {}
        Ok(_) => return Err(Error::CacheFormat("trailing data after the last row".to_string())),
        Err(e) => return Err(format_error(e)),
    }

    Ok(Corpus { examples, provenance })
}

/// Restores a corpus written by `save_cache`
pub fn load_cached(path: &Path) -> Result<Corpus> {
    let file = File::open(path)?;
    let mut decoder = zstd::Decoder::new(BufReader::new(file)).map_err(format_error)?;
    read_corpus(&mut decoder)
}
