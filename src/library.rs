use crate::error::{Error, Result};
use crate::model::Track;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedEntry {
    pub name: String,
    pub is_file: bool,
}

/// Enumerates one directory level of the content medium.
pub trait ContentLister: Send {
    fn list(&self, dir: &Path) -> anyhow::Result<Vec<ListedEntry>>;
}

pub struct FsLister;

impl ContentLister for FsLister {
    fn list(&self, dir: &Path) -> anyhow::Result<Vec<ListedEntry>> {
        let mut entries = Vec::new();
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1).follow_links(true) {
            let entry = entry?;
            entries.push(ListedEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                is_file: entry.file_type().is_file(),
            });
        }
        Ok(entries)
    }
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub extensions: Vec<String>,
    pub max_tracks: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            extensions: vec![String::from("mp3")],
            max_tracks: 512,
        }
    }
}

pub struct TrackStore {
    root: PathBuf,
    options: ScanOptions,
    lister: Box<dyn ContentLister>,
    tracks: Vec<Track>,
}

impl TrackStore {
    pub fn scan(
        root: impl Into<PathBuf>,
        lister: Box<dyn ContentLister>,
        options: ScanOptions,
    ) -> Result<Self> {
        let mut store = Self::unscanned(root, lister, options);
        store.rescan()?;
        Ok(store)
    }

    /// Store bound to `root` that has not listed anything yet.
    pub fn unscanned(
        root: impl Into<PathBuf>,
        lister: Box<dyn ContentLister>,
        options: ScanOptions,
    ) -> Self {
        Self {
            root: root.into(),
            options,
            lister,
            tracks: Vec::new(),
        }
    }

    /// Fixed track list, no backing directory. Rescans keep the list.
    pub fn from_tracks(tracks: Vec<Track>) -> Self {
        Self {
            root: PathBuf::new(),
            options: ScanOptions::default(),
            lister: Box::new(FixedLister),
            tracks,
        }
    }

    pub fn rescan(&mut self) -> Result<usize> {
        if self.root.as_os_str().is_empty() {
            return Ok(self.tracks.len());
        }

        let mut entries = self.lister.list(&self.root).map_err(|err| {
            Error::ResourceUnavailable(format!(
                "failed to list {}: {err:#}",
                self.root.display()
            ))
        })?;
        entries.retain(|entry| entry.is_file && self.is_audio(&entry.name));
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        if entries.len() > self.options.max_tracks {
            warn!(
                found = entries.len(),
                max = self.options.max_tracks,
                "track limit reached, ignoring the rest"
            );
            entries.truncate(self.options.max_tracks);
        }

        self.tracks = entries
            .into_iter()
            .enumerate()
            .map(|(index, entry)| Track {
                index,
                path: self.root.join(&entry.name),
                name: entry.name,
            })
            .collect();

        info!(count = self.tracks.len(), root = %self.root.display(), "tracks scanned");
        Ok(self.tracks.len())
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn get(&self, index: usize) -> Option<&Track> {
        self.tracks.get(index)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn find(&self, identifier: &str) -> Option<usize> {
        self.tracks
            .iter()
            .position(|track| track.matches(identifier))
    }

    pub fn names(&self) -> Vec<String> {
        self.tracks.iter().map(|track| track.name.clone()).collect()
    }

    fn is_audio(&self, name: &str) -> bool {
        let ext = Path::new(name)
            .extension()
            .and_then(OsStr::to_str)
            .unwrap_or_default();
        self.options
            .extensions
            .iter()
            .any(|supported| ext.eq_ignore_ascii_case(supported))
    }
}

struct FixedLister;

impl ContentLister for FixedLister {
    fn list(&self, _dir: &Path) -> anyhow::Result<Vec<ListedEntry>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    struct StaticLister(Vec<ListedEntry>);

    impl ContentLister for StaticLister {
        fn list(&self, _dir: &Path) -> anyhow::Result<Vec<ListedEntry>> {
            Ok(self.0.clone())
        }
    }

    fn entry(name: &str, is_file: bool) -> ListedEntry {
        ListedEntry {
            name: name.to_string(),
            is_file,
        }
    }

    #[test]
    fn scan_keeps_regular_audio_files_sorted_by_name() {
        let lister = StaticLister(vec![
            entry("b.mp3", true),
            entry("notes.txt", true),
            entry("a.MP3", true),
            entry("folder.mp3", false),
        ]);
        let store =
            TrackStore::scan("/sd", Box::new(lister), ScanOptions::default()).expect("scan");

        assert_eq!(store.names(), vec!["a.MP3", "b.mp3"]);
        assert_eq!(store.get(1).map(|t| t.path.clone()), Some(PathBuf::from("/sd/b.mp3")));
        assert_eq!(store.get(1).map(|t| t.index), Some(1));
    }

    #[test]
    fn scan_caps_track_count() {
        let lister = StaticLister((0..10).map(|n| entry(&format!("{n}.mp3"), true)).collect());
        let options = ScanOptions {
            max_tracks: 4,
            ..ScanOptions::default()
        };
        let store = TrackStore::scan("/sd", Box::new(lister), options).expect("scan");
        assert_eq!(store.len(), 4);
    }

    #[test]
    fn find_accepts_name_or_path() {
        let lister = StaticLister(vec![entry("a.mp3", true), entry("b.mp3", true)]);
        let store =
            TrackStore::scan("/sd", Box::new(lister), ScanOptions::default()).expect("scan");
        assert_eq!(store.find("b.mp3"), Some(1));
        assert_eq!(store.find("/sd/a.mp3"), Some(0));
        assert_eq!(store.find("c.mp3"), None);
    }

    #[test]
    fn fs_lister_scans_one_level_and_rescan_picks_up_new_files() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("one.mp3"), b"x").expect("write");
        fs::create_dir(dir.path().join("nested")).expect("mkdir");
        fs::write(dir.path().join("nested").join("deep.mp3"), b"x").expect("write");

        let mut store = TrackStore::scan(dir.path(), Box::new(FsLister), ScanOptions::default())
            .expect("scan");
        assert_eq!(store.names(), vec!["one.mp3"]);

        fs::write(dir.path().join("two.mp3"), b"x").expect("write");
        assert_eq!(store.rescan().expect("rescan"), 2);
    }

    #[test]
    fn missing_directory_is_resource_unavailable() {
        let dir = tempdir().expect("tempdir");
        let missing = dir.path().join("absent");
        let err = TrackStore::scan(missing, Box::new(FsLister), ScanOptions::default())
            .err()
            .expect("scan should fail");
        assert!(matches!(err, Error::ResourceUnavailable(_)));
    }
}
