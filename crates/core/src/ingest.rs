use crate::error::IngestError;
use crate::fingerprint::content_checksum;
use crate::models::{DocumentRef, SourceDocument};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

pub fn discover_pdf_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_pdf = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));

        if is_pdf {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

/// Identity of `path` relative to `root`, joined with `/` on every platform.
pub fn document_identity(root: &Path, path: &Path) -> Result<String, IngestError> {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let parts: Vec<String> = relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().to_string()),
            _ => None,
        })
        .collect();

    if parts.is_empty() {
        return Err(IngestError::InvalidArgument(format!(
            "path has no file name: {}",
            path.display()
        )));
    }
    Ok(parts.join("/"))
}

/// Finds every PDF under `folder`; an empty folder is a caller error.
pub fn discover_documents(folder: &Path) -> Result<Vec<DocumentRef>, IngestError> {
    if !folder.is_dir() {
        return Err(IngestError::InvalidArgument(format!(
            "data directory not found: {}",
            folder.display()
        )));
    }

    let files = discover_pdf_files(folder);
    if files.is_empty() {
        return Err(IngestError::InvalidArgument(format!(
            "no pdf files found in {}",
            folder.display()
        )));
    }

    files
        .into_iter()
        .map(|path| {
            let identity = document_identity(folder, &path)?;
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_else(|| identity.clone());
            Ok(DocumentRef {
                identity,
                name,
                path,
            })
        })
        .collect()
}

impl SourceDocument {
    pub async fn load(document: &DocumentRef) -> Result<Self, IngestError> {
        let bytes = tokio::fs::read(&document.path).await?;
        Ok(Self {
            identity: document.identity.clone(),
            name: document.name.clone(),
            path: document.path.clone(),
            checksum: content_checksum(&bytes),
            bytes,
        })
    }
}
