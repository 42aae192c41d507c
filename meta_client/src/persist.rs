//! Client-side persistence of the known meta server list.
//!
//! A JSON array in `<dir>/meta.db`, written with the create-temp, fsync,
//! rename idiom so a crash never leaves a torn file behind.

use std::fs::{self, File};
use std::io;
use std::path::Path;

const META_FILE: &str = "meta.db";

pub(crate) fn save_meta_servers(dir: &Path, servers: &[String]) -> io::Result<()> {
    fs::create_dir_all(dir)?;

    let file = dir.join(META_FILE);
    let tmp = dir.join(format!("{META_FILE}.tmp"));

    let f = File::create(&tmp)?;
    serde_json::to_writer(&f, servers).map_err(io::Error::other)?;
    f.sync_all()?;
    drop(f);

    fs::rename(tmp, file)
}

/// `Ok(None)` when no server list has been persisted yet.
pub(crate) fn load_meta_servers(dir: &Path) -> io::Result<Option<Vec<String>>> {
    let file = dir.join(META_FILE);
    let contents = match fs::read(&file) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    serde_json::from_slice(&contents)
        .map(Some)
        .map_err(io::Error::other)
}
