// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
//! Virtual file system contract shared by the embedded asset tree, the blob
//! mirror and the per-reconcile scratch tree. Paths are POSIX-style with `/`
//! separators and no leading slash.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Cursor, Read};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use rust_embed::RustEmbed;

use crate::error::{Error, Result};
use crate::transformer::blob::{BlobFileSystem, BlobStore};

/// Compiled-in template assets. The well-known composition source
/// `v1/apply/apply.yaml` lives here.
#[derive(RustEmbed)]
#[folder = "assets/"]
struct Assets;

pub type WalkFn<'a> = dyn FnMut(&str, bool) -> Result<()> + 'a;

pub trait VirtualFileSystem: Send + Sync + std::fmt::Debug {
    fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    fn open(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        let data = self.read_file(path)?;
        Ok(Box::new(Cursor::new(data)))
    }

    fn exists(&self, path: &str) -> bool;

    fn is_dir(&self, path: &str) -> bool;

    /// Names of the entries directly under a directory.
    fn read_dir(&self, path: &str) -> Result<Vec<String>>;

    /// Matching file paths, `*` and `?` wildcards within path segments.
    fn glob(&self, pattern: &str) -> Result<Vec<String>>;

    /// Splits a path into its directory and file component; a directory path
    /// yields an empty file component.
    fn cleaned_abs(&self, path: &str) -> Result<(String, String)> {
        let cleaned = clean_path(path);
        if self.is_dir(&cleaned) {
            return Ok((cleaned, String::new()));
        }
        if !self.exists(&cleaned) {
            return Err(Error::FileNotFound(cleaned));
        }
        match cleaned.rsplit_once('/') {
            Some((dir, file)) => Ok((dir.to_string(), file.to_string())),
            None => Ok((String::new(), cleaned)),
        }
    }

    /// Visits every entry under `root` in lexical order, stopping at the
    /// first callback error.
    fn walk(&self, root: &str, visit: &mut WalkFn) -> Result<()>;

    fn write_file(&self, _path: &str, _data: &[u8]) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn mkdir_all(&self, _path: &str) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn remove_all(&self, _path: &str) -> Result<()> {
        Err(Error::NotSupported)
    }
}

/// Normalizes separators and strips leading/trailing slashes.
pub fn clean_path(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

pub fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

pub fn parent_dir(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some((dir, _)) => dir,
        None => "",
    }
}

pub fn join_path(left: &str, right: &str) -> String {
    let left = clean_path(left);
    let right = clean_path(right);
    if left.is_empty() {
        right
    } else if right.is_empty() {
        left
    } else {
        format!("{left}/{right}")
    }
}

fn segment_match(pattern: &str, segment: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let s: Vec<char> = segment.chars().collect();
    segment_match_at(&p, 0, &s, 0)
}

fn segment_match_at(p: &[char], pi: usize, s: &[char], si: usize) -> bool {
    if pi == p.len() {
        return si == s.len();
    }
    match p[pi] {
        '*' => {
            for skip in si..=s.len() {
                if segment_match_at(p, pi + 1, s, skip) {
                    return true;
                }
            }
            false
        }
        '?' => si < s.len() && segment_match_at(p, pi + 1, s, si + 1),
        c => si < s.len() && s[si] == c && segment_match_at(p, pi + 1, s, si + 1),
    }
}

pub(crate) fn glob_match(pattern: &str, path: &str) -> bool {
    let cleaned_pattern = clean_path(pattern);
    let pattern_segments: Vec<&str> = cleaned_pattern.split('/').collect();
    let path_segments: Vec<&str> = path.split('/').collect();
    pattern_segments.len() == path_segments.len()
        && pattern_segments
            .iter()
            .zip(path_segments.iter())
            .all(|(p, s)| segment_match(p, s))
}

fn dirs_of(files: impl Iterator<Item = String>) -> BTreeSet<String> {
    let mut dirs = BTreeSet::new();
    for file in files {
        let mut dir = parent_dir(&file).to_string();
        while !dir.is_empty() {
            if !dirs.insert(dir.clone()) {
                break;
            }
            dir = parent_dir(&dir).to_string();
        }
    }
    dirs
}

fn walk_tree(
    files: &BTreeMap<String, Vec<u8>>,
    dirs: &BTreeSet<String>,
    root: &str,
    visit: &mut WalkFn,
) -> Result<()> {
    let root = clean_path(root);
    let mut entries: BTreeMap<String, bool> = BTreeMap::new();
    for dir in dirs {
        if dir == &root || is_under(&root, dir) {
            entries.insert(dir.clone(), true);
        }
    }
    for file in files.keys() {
        if is_under(&root, file) {
            entries.insert(file.clone(), false);
        }
    }
    if !entries.contains_key(&root) && !root.is_empty() {
        if files.contains_key(&root) {
            entries.insert(root.clone(), false);
        } else {
            return Err(Error::FileNotFound(root));
        }
    }
    for (path, is_dir) in entries {
        visit(&path, is_dir)?;
    }
    Ok(())
}

fn is_under(root: &str, path: &str) -> bool {
    if root.is_empty() {
        return true;
    }
    path.strip_prefix(root)
        .map(|rest| rest.starts_with('/'))
        .unwrap_or(false)
}

/// Writable in-memory tree. Backs the scratch tree and the blob mirror.
#[derive(Default, Debug)]
pub struct MemoryFileSystem {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
    dirs: RwLock<BTreeSet<String>>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        MemoryFileSystem::default()
    }

    fn lock_poisoned() -> Error {
        Error::BlobStore("file system lock poisoned".to_string())
    }
}

impl VirtualFileSystem for MemoryFileSystem {
    fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let path = clean_path(path);
        let files = self.files.read().map_err(|_| Self::lock_poisoned())?;
        files
            .get(&path)
            .cloned()
            .ok_or(Error::FileNotFound(path))
    }

    fn exists(&self, path: &str) -> bool {
        let path = clean_path(path);
        self.files
            .read()
            .map(|files| files.contains_key(&path))
            .unwrap_or(false)
            || self.is_dir(&path)
    }

    fn is_dir(&self, path: &str) -> bool {
        let path = clean_path(path);
        self.dirs
            .read()
            .map(|dirs| dirs.contains(&path))
            .unwrap_or(false)
    }

    fn read_dir(&self, path: &str) -> Result<Vec<String>> {
        let path = clean_path(path);
        if !self.is_dir(&path) {
            return Err(Error::FileNotFound(path));
        }
        let files = self.files.read().map_err(|_| Self::lock_poisoned())?;
        let dirs = self.dirs.read().map_err(|_| Self::lock_poisoned())?;
        let mut entries = BTreeSet::new();
        for candidate in files.keys().chain(dirs.iter()) {
            if is_under(&path, candidate) {
                let rest = &candidate[path.len() + usize::from(!path.is_empty())..];
                if let Some(first) = rest.split('/').next() {
                    if !first.is_empty() {
                        entries.insert(first.to_string());
                    }
                }
            }
        }
        Ok(entries.into_iter().collect())
    }

    fn glob(&self, pattern: &str) -> Result<Vec<String>> {
        let files = self.files.read().map_err(|_| Self::lock_poisoned())?;
        Ok(files
            .keys()
            .filter(|path| glob_match(pattern, path))
            .cloned()
            .collect())
    }

    fn walk(&self, root: &str, visit: &mut WalkFn) -> Result<()> {
        let files = self.files.read().map_err(|_| Self::lock_poisoned())?;
        let dirs = self.dirs.read().map_err(|_| Self::lock_poisoned())?;
        walk_tree(&files, &dirs, root, visit)
    }

    fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let path = clean_path(path);
        self.mkdir_all(parent_dir(&path))?;
        let mut files = self.files.write().map_err(|_| Self::lock_poisoned())?;
        files.insert(path, data.to_vec());
        Ok(())
    }

    fn mkdir_all(&self, path: &str) -> Result<()> {
        let mut dir = clean_path(path);
        let mut dirs = self.dirs.write().map_err(|_| Self::lock_poisoned())?;
        while !dir.is_empty() {
            dirs.insert(dir.clone());
            dir = parent_dir(&dir).to_string();
        }
        Ok(())
    }

    fn remove_all(&self, path: &str) -> Result<()> {
        let path = clean_path(path);
        let mut files = self.files.write().map_err(|_| Self::lock_poisoned())?;
        let mut dirs = self.dirs.write().map_err(|_| Self::lock_poisoned())?;
        files.retain(|candidate, _| candidate != &path && !is_under(&path, candidate));
        dirs.retain(|candidate| candidate != &path && !is_under(&path, candidate));
        Ok(())
    }
}

/// Read-only view over the compiled-in asset tree.
#[derive(Debug)]
pub struct EmbeddedFileSystem {
    files: BTreeSet<String>,
    dirs: BTreeSet<String>,
}

impl EmbeddedFileSystem {
    pub fn new() -> Self {
        let files: BTreeSet<String> = Assets::iter().map(|name| name.to_string()).collect();
        let dirs = dirs_of(files.iter().cloned());
        EmbeddedFileSystem { files, dirs }
    }
}

impl Default for EmbeddedFileSystem {
    fn default() -> Self {
        EmbeddedFileSystem::new()
    }
}

impl VirtualFileSystem for EmbeddedFileSystem {
    fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let path = clean_path(path);
        Assets::get(&path)
            .map(|file| file.data.into_owned())
            .ok_or(Error::FileNotFound(path))
    }

    fn exists(&self, path: &str) -> bool {
        let path = clean_path(path);
        self.files.contains(&path) || self.dirs.contains(&path)
    }

    fn is_dir(&self, path: &str) -> bool {
        self.dirs.contains(&clean_path(path))
    }

    fn read_dir(&self, path: &str) -> Result<Vec<String>> {
        let path = clean_path(path);
        if !self.is_dir(&path) {
            return Err(Error::FileNotFound(path));
        }
        let mut entries = BTreeSet::new();
        for candidate in self.files.iter().chain(self.dirs.iter()) {
            if is_under(&path, candidate) {
                let rest = &candidate[path.len() + usize::from(!path.is_empty())..];
                if let Some(first) = rest.split('/').next() {
                    if !first.is_empty() {
                        entries.insert(first.to_string());
                    }
                }
            }
        }
        Ok(entries.into_iter().collect())
    }

    fn glob(&self, pattern: &str) -> Result<Vec<String>> {
        Ok(self
            .files
            .iter()
            .filter(|path| glob_match(pattern, path))
            .cloned()
            .collect())
    }

    fn walk(&self, root: &str, visit: &mut WalkFn) -> Result<()> {
        let root = clean_path(root);
        let mut entries: BTreeMap<String, bool> = BTreeMap::new();
        for dir in &self.dirs {
            if dir == &root || is_under(&root, dir) {
                entries.insert(dir.clone(), true);
            }
        }
        for file in &self.files {
            if is_under(&root, file) || file == &root {
                entries.insert(file.clone(), false);
            }
        }
        if entries.is_empty() {
            return Err(Error::FileNotFound(root));
        }
        for (path, is_dir) in entries {
            visit(&path, is_dir)?;
        }
        Ok(())
    }
}

/// Resolves a `scheme:/path` URI to a backend and a root path with its
/// leading slash trimmed.
#[async_trait]
pub trait FsProvider: Send + Sync {
    async fn resolve(&self, path: &str) -> Result<(Arc<dyn VirtualFileSystem>, String)>;
}

pub struct DefaultFsProvider {
    embedded: Arc<EmbeddedFileSystem>,
    blob_store: Arc<dyn BlobStore>,
}

impl DefaultFsProvider {
    pub fn new(blob_store: Arc<dyn BlobStore>) -> Self {
        DefaultFsProvider {
            embedded: Arc::new(EmbeddedFileSystem::new()),
            blob_store,
        }
    }
}

#[async_trait]
impl FsProvider for DefaultFsProvider {
    async fn resolve(&self, path: &str) -> Result<(Arc<dyn VirtualFileSystem>, String)> {
        let url = url::Url::parse(path).map_err(|_| Error::MalformedVirtualPath(path.into()))?;
        match url.scheme() {
            "embedded" => {
                let root = url.path().trim_start_matches('/').to_string();
                Ok((self.embedded.clone(), root))
            }
            "blob" => {
                let trimmed = url.path().trim_start_matches('/');
                let (bucket, object_path) = trimmed
                    .split_once('/')
                    .ok_or_else(|| Error::MalformedVirtualPath(path.into()))?;
                if bucket.is_empty() || object_path.is_empty() {
                    return Err(Error::MalformedVirtualPath(path.into()));
                }
                let fs =
                    BlobFileSystem::materialize(self.blob_store.as_ref(), bucket, object_path)
                        .await?;
                Ok((Arc::new(fs), object_path.to_string()))
            }
            scheme => Err(Error::UnsupportedScheme {
                scheme: scheme.to_string(),
                path: path.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> MemoryFileSystem {
        let fs = MemoryFileSystem::new();
        fs.write_file("tmp/ns/name/a.yaml", b"a").unwrap();
        fs.write_file("tmp/ns/name/sub/b.yaml", b"b").unwrap();
        fs.write_file("tmp/other.yaml", b"o").unwrap();
        fs
    }

    #[test]
    fn memory_fs_round_trips_files() {
        let fs = scratch();
        assert_eq!(fs.read_file("tmp/ns/name/a.yaml").unwrap(), b"a");
        assert!(fs.exists("tmp/ns/name"));
        assert!(fs.is_dir("tmp/ns"));
        assert!(!fs.is_dir("tmp/ns/name/a.yaml"));
        assert!(matches!(
            fs.read_file("tmp/missing.yaml"),
            Err(Error::FileNotFound(_))
        ));
    }

    #[test]
    fn memory_fs_walk_is_lexical_and_scoped() {
        let fs = scratch();
        let mut seen = Vec::new();
        fs.walk("tmp/ns", &mut |path, is_dir| {
            if !is_dir {
                seen.push(path.to_string());
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec!["tmp/ns/name/a.yaml", "tmp/ns/name/sub/b.yaml"]);
    }

    #[test]
    fn memory_fs_walk_stops_on_first_error() {
        let fs = scratch();
        let mut count = 0;
        let result = fs.walk("tmp", &mut |_, _| {
            count += 1;
            Err(Error::NotSupported)
        });
        assert!(result.is_err());
        assert_eq!(count, 1);
    }

    #[test]
    fn read_dir_lists_direct_children_only() {
        let fs = scratch();
        assert_eq!(fs.read_dir("tmp/ns/name").unwrap(), vec!["a.yaml", "sub"]);
        assert_eq!(fs.read_dir("tmp").unwrap(), vec!["ns", "other.yaml"]);
    }

    #[test]
    fn glob_matches_within_segments() {
        let fs = scratch();
        assert_eq!(
            fs.glob("tmp/ns/name/*.yaml").unwrap(),
            vec!["tmp/ns/name/a.yaml"]
        );
        assert!(fs.glob("tmp/*.yml").unwrap().is_empty());
    }

    #[test]
    fn cleaned_abs_splits_dir_and_file() {
        let fs = scratch();
        assert_eq!(
            fs.cleaned_abs("tmp/ns/name/a.yaml").unwrap(),
            ("tmp/ns/name".to_string(), "a.yaml".to_string())
        );
        assert_eq!(
            fs.cleaned_abs("tmp/ns").unwrap(),
            ("tmp/ns".to_string(), String::new())
        );
    }

    #[test]
    fn embedded_fs_is_read_only_and_carries_the_apply_asset() {
        let fs = EmbeddedFileSystem::new();
        assert!(fs.exists("v1/apply/apply.yaml"));
        assert!(fs.is_dir("v1/apply"));
        assert!(matches!(
            fs.write_file("v1/new.yaml", b"x"),
            Err(Error::NotSupported)
        ));
        assert!(matches!(fs.mkdir_all("v1/other"), Err(Error::NotSupported)));
    }

    #[tokio::test]
    async fn provider_rejects_unknown_schemes_and_bucket_only_paths() {
        let provider =
            DefaultFsProvider::new(Arc::new(crate::testutil::StaticBlobStore::default()));
        let err = provider.resolve("http://example.com/x").await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedScheme { .. }));

        let err = provider.resolve("blob:/only-bucket").await.unwrap_err();
        assert!(matches!(err, Error::MalformedVirtualPath(_)));
    }

    #[tokio::test]
    async fn provider_trims_the_embedded_root() {
        let provider =
            DefaultFsProvider::new(Arc::new(crate::testutil::StaticBlobStore::default()));
        let (_fs, root) = provider.resolve("embedded:/v1/apply").await.unwrap();
        assert_eq!(root, "v1/apply");
    }
}
