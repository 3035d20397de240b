//! Persistence of the node index.
//!
//! The index is serialized as one self-describing JSON document and
//! written via temp-file + atomic rename, so `restore` can never observe
//! a partially written file. Missing files restore as empty; corrupt
//! files are the caller's decision (logged and treated as empty).

use crate::node::Node;
use crate::RepoError;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

/// Write the entire index to `path`, crash-atomically.
pub fn save(path: &Path, index: &HashMap<String, Node>) -> Result<(), RepoError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let tmp = tmp_path(path);
    {
        let file = File::create(&tmp)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, index)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Read a previously saved index from `path`.
///
/// A missing file yields an empty index; any other failure is returned
/// for the caller to log.
pub fn restore(path: &Path) -> Result<HashMap<String, Node>, RepoError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(RepoError::Io(e)),
    };

    let reader = BufReader::new(file);
    let index = serde_json::from_reader(reader)?;
    Ok(index)
}
