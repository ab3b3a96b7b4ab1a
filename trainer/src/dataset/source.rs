use crate::error::Result;
use std::fs::File;
use std::io::{self, BufReader, Read};

/// Opens a path or an http(s) URL of a `.pgn` or `.pgn.zst` file
pub fn open(location: &str) -> Result<Box<dyn Read>> {
    // raw data stream (may be compressed)
    let is_url = location.starts_with("http://") || location.starts_with("https://");
    let raw_reader: Box<dyn Read> = if is_url {
        let response = reqwest::blocking::get(location)
            .and_then(|r| r.error_for_status())
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Box::new(response)
    } else {
        Box::new(BufReader::new(File::open(location)?))
    };

    // decompress if necessary
    let reader: Box<dyn Read> = if location.ends_with(".zst") {
        Box::new(zstd::Decoder::new(raw_reader)?)
    } else {
        raw_reader
    };

    Ok(reader)
}
