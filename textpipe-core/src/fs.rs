//! # Sistema de Arquivos
//!
//! As quatro operações que o resto do crate usa: `exists`, `walk_files`, `read_bytes`
//! e `new_writer`. Erros de E/S carregam o caminho envolvido na mensagem.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::File;
use walkdir::WalkDir;

use crate::error::{PipelineError, Result};

fn with_path(path: &Path, err: io::Error) -> PipelineError {
    PipelineError::Io(io::Error::new(
        err.kind(),
        format!("{}: {err}", path.display()),
    ))
}

pub fn exists(path: impl AsRef<Path>) -> bool {
    path.as_ref().exists()
}

pub fn read_bytes(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let path = path.as_ref();
    std::fs::read(path).map_err(|e| with_path(path, e))
}

/// Arquivos sob `root` com a extensão dada, em ordem de caminho.
///
/// Se `root` for um arquivo, ele é devolvido sozinho (qualquer que seja a extensão).
pub fn walk_files(root: impl AsRef<Path>, extension: &str) -> Result<Vec<PathBuf>> {
    let root = root.as_ref();
    if !root.exists() {
        return Err(with_path(
            root,
            io::Error::new(io::ErrorKind::NotFound, "caminho não existe"),
        ));
    }
    if root.is_file() {
        return Ok(vec![root.to_path_buf()]);
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| with_path(root, e.into()))?;
        if entry.file_type().is_file()
            && entry.path().extension().map_or(false, |ext| ext == extension)
        {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

/// Cria (ou trunca) um arquivo para escrita, criando os diretórios que faltarem.
pub async fn new_writer(path: impl AsRef<Path>) -> Result<File> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| with_path(parent, e))?;
    }
    File::create(path).await.map_err(|e| with_path(path, e))
}
