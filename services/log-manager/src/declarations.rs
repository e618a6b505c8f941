//! Loading log declarations from disk.
//!
//! Each file in the declaration directory holds one JSON [`Declaration`].
//! Files that cannot be read or parsed are skipped with an error log; only
//! an unreadable directory fails the load.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use logfleet_reconcile::Declaration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Declaration loading errors.
#[derive(Debug, Error)]
pub enum DeclarationError {
    #[error("failed to read declaration dir {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Load every declaration in `dir`, in file name order.
pub fn load_declarations(dir: &Path) -> Result<Vec<Declaration>, DeclarationError> {
    let read_dir = |source| DeclarationError::ReadDir {
        path: dir.to_path_buf(),
        source,
    };

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(read_dir)? {
        let path = entry.map_err(read_dir)?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();

    let mut seen = BTreeSet::new();
    let mut declarations = Vec::new();

    for path in files {
        let Some(declaration) = load_file(&path) else {
            continue;
        };
        if !seen.insert(declaration.key()) {
            warn!(
                path = %path.display(),
                key = %declaration.key(),
                "Duplicate log declaration, keeping the first"
            );
            continue;
        }
        debug!(path = %path.display(), key = %declaration.key(), "Loaded log declaration");
        declarations.push(declaration);
    }

    info!(dir = %dir.display(), count = declarations.len(), "Loaded log declarations");
    Ok(declarations)
}

fn load_file(path: &Path) -> Option<Declaration> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) => {
            error!(path = %path.display(), error = %e, "Failed to read log declaration");
            return None;
        }
    };

    let declaration: Declaration = match serde_json::from_slice(&raw) {
        Ok(declaration) => declaration,
        Err(e) => {
            error!(path = %path.display(), error = %e, "Failed to parse log declaration");
            return None;
        }
    };

    if let Err(e) = declaration.template() {
        error!(path = %path.display(), error = %e, "Log declaration has an invalid template");
        return None;
    }

    Some(declaration)
}
