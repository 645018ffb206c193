use std::{
    fs,
    io,
    path::{Component, Path, PathBuf},
};
use walkdir::WalkDir;

/// Read access to the files of one stored package, addressed by `/`-separated
/// paths relative to the package root.
pub trait PackageFiles {
    fn exists(&self, rel: &str) -> bool;
    fn list(&self) -> Vec<String>;
    fn read_to_string(&self, rel: &str) -> io::Result<String>;
}

#[derive(Debug, Clone)]
pub struct DirStorage {
    root: PathBuf,
}

impl DirStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Joins `rel` under the root, refusing anything that could escape it.
    fn resolve(&self, rel: &str) -> Option<PathBuf> {
        let rel = Path::new(rel.trim_start_matches("./"));
        if rel.components().all(|c| matches!(c, Component::Normal(_))) {
            Some(self.root.join(rel))
        } else {
            None
        }
    }
}

impl PackageFiles for DirStorage {
    fn exists(&self, rel: &str) -> bool {
        self.resolve(rel).map(|p| p.is_file()).unwrap_or(false)
    }

    fn list(&self) -> Vec<String> {
        let mut files: Vec<String> = WalkDir::new(&self.root)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| {
                let rel = e.path().strip_prefix(&self.root).ok()?;
                Some(
                    rel.components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/"),
                )
            })
            .collect();
        files.sort();
        files
    }

    fn read_to_string(&self, rel: &str) -> io::Result<String> {
        let path = self
            .resolve(rel)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("bad path {rel:?}")))?;
        fs::read_to_string(path)
    }
}

/// Shallowest `imsmanifest.xml` in the package, as a relative path.
pub fn find_manifest(files: &impl PackageFiles) -> Option<String> {
    files
        .list()
        .into_iter()
        .filter(|f| f.rsplit('/').next() == Some("imsmanifest.xml"))
        .min_by_key(|f| (f.matches('/').count(), f.clone()))
}

pub fn extract_zip_to_dir(bytes: &[u8], out_dir: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(out_dir)?;
    let reader = io::Cursor::new(bytes);
    let mut zip = zip::ZipArchive::new(reader)?;
    for i in 0..zip.len() {
        let mut file = zip.by_index(i)?;
        let Some(name) = file.enclosed_name().map(Path::to_path_buf) else {
            tracing::warn!(entry = file.name(), "skipping zip entry outside package root");
            continue;
        };
        let outpath = out_dir.join(name);
        if file.is_dir() {
            fs::create_dir_all(&outpath)?;
            continue;
        }
        if let Some(parent) = outpath.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut outfile = fs::File::create(&outpath)?;
        io::copy(&mut file, &mut outfile)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_relative_paths_and_finds_shallowest_manifest() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("course/nested")).unwrap();
        fs::write(dir.path().join("course/imsmanifest.xml"), "<manifest/>").unwrap();
        fs::write(dir.path().join("course/nested/imsmanifest.xml"), "<manifest/>").unwrap();
        fs::write(dir.path().join("course/index.html"), "").unwrap();

        let files = DirStorage::new(dir.path());
        assert_eq!(
            files.list(),
            vec![
                "course/imsmanifest.xml",
                "course/index.html",
                "course/nested/imsmanifest.xml"
            ]
        );
        assert_eq!(find_manifest(&files).as_deref(), Some("course/imsmanifest.xml"));
        assert!(files.exists("course/index.html"));
        assert!(files.exists("./course/index.html"));
        assert!(!files.exists("../etc/passwd"));
        assert!(!files.exists("course"));
    }
}
