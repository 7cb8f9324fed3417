//! Durable record store backing resume.
//!
//! A flat directory holds three append-only ID files (one per record
//! kind), the pending-MID set, and the per-video comment checkpoint
//! document. Appends rely on the OS `O_APPEND` semantics for crash
//! safety; duplicates on disk are tolerated because dedup is semantic.

use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const PENDING_FILE: &str = "pending_mids.txt";
const PROGRESS_FILE: &str = "video_comment_progress.json";

/// The three record categories the crawler emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Video,
    Comment,
    Account,
}

impl RecordKind {
    pub fn record_file(self) -> &'static str {
        match self {
            RecordKind::Video => "sent_videos.txt",
            RecordKind::Comment => "sent_comments.txt",
            RecordKind::Account => "sent_accounts.txt",
        }
    }
}

/// Comment-crawl checkpoint for one video.
///
/// `done` is terminal; an empty cursor on a non-done entry means the crawl
/// has not started; otherwise the crawl resumes from `cursor`. `aid`
/// caches the numeric ID so a restart need not re-resolve it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoProgress {
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub cursor: String,
    #[serde(default)]
    pub aid: i64,
}

#[derive(Debug)]
pub struct RecordStore {
    root: PathBuf,
    // One lock for every load-mutate-save of the progress document.
    progress: Mutex<()>,
}

impl RecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            progress: Mutex::new(()),
        }
    }

    fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create record dir {}", self.root.display()))
    }

    fn append_line(&self, file: &str, id: &str) -> Result<()> {
        self.ensure_root()?;
        let path = self.root.join(file);
        let mut f = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        writeln!(f, "{id}").with_context(|| format!("failed to append to {}", path.display()))
    }

    fn load_lines(&self, file: &str) -> Result<HashSet<String>> {
        let path = self.root.join(file);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashSet::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToString::to_string)
            .collect())
    }

    /// Append an emitted ID to the record file for `kind`.
    pub fn record_emitted(&self, kind: RecordKind, id: &str) -> Result<()> {
        self.append_line(kind.record_file(), id)
    }

    /// The set of IDs ever recorded for `kind`, blanks filtered.
    pub fn load_emitted(&self, kind: RecordKind) -> Result<HashSet<String>> {
        self.load_lines(kind.record_file())
    }

    pub fn save_pending(&self, mid: &str) -> Result<()> {
        self.append_line(PENDING_FILE, mid)
    }

    pub fn load_pending(&self) -> Result<HashSet<String>> {
        self.load_lines(PENDING_FILE)
    }

    /// Rewrite the pending-MID file to exactly `remaining`, atomically.
    /// An empty set removes the file.
    pub fn update_pending(&self, remaining: &HashSet<String>) -> Result<()> {
        let path = self.root.join(PENDING_FILE);
        if remaining.is_empty() {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("failed to remove {}", path.display()))
                }
            }
            return Ok(());
        }

        self.ensure_root()?;
        let tmp = self.root.join(format!("{PENDING_FILE}.tmp"));
        let mut body = String::new();
        for mid in remaining {
            body.push_str(mid);
            body.push('\n');
        }
        fs::write(&tmp, body).with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to replace {}", path.display()))
    }

    /// Checkpoint the comment cursor for a video. A zero `aid` leaves any
    /// previously cached value in place.
    pub fn save_progress(&self, bvid: &str, cursor: &str, aid: i64) -> Result<()> {
        let _guard = self.progress.lock().expect("progress lock poisoned");
        let mut map = self.load_progress_map()?;
        let entry = map.entry(bvid.to_string()).or_default();
        entry.cursor = cursor.to_string();
        if aid != 0 {
            entry.aid = aid;
        }
        self.write_progress_map(&map)
    }

    /// Mark a video's comment crawl finished. Terminal: the cursor is
    /// cleared and the cached aid preserved.
    pub fn mark_done(&self, bvid: &str) -> Result<()> {
        let _guard = self.progress.lock().expect("progress lock poisoned");
        let mut map = self.load_progress_map()?;
        let entry = map.entry(bvid.to_string()).or_default();
        entry.done = true;
        entry.cursor.clear();
        self.write_progress_map(&map)
    }

    pub fn get_progress(&self, bvid: &str) -> Result<VideoProgress> {
        let _guard = self.progress.lock().expect("progress lock poisoned");
        let mut map = self.load_progress_map()?;
        Ok(map.remove(bvid).unwrap_or_default())
    }

    pub fn load_all_progress(&self) -> Result<HashMap<String, VideoProgress>> {
        let _guard = self.progress.lock().expect("progress lock poisoned");
        self.load_progress_map()
    }

    fn load_progress_map(&self) -> Result<HashMap<String, VideoProgress>> {
        let path = self.root.join(PROGRESS_FILE);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        // A corrupt checkpoint file is recovered as empty rather than
        // aborting the crawl.
        Ok(serde_json::from_str(&content).unwrap_or_default())
    }

    fn write_progress_map(&self, map: &HashMap<String, VideoProgress>) -> Result<()> {
        self.ensure_root()?;
        let path = self.root.join(PROGRESS_FILE);
        let content =
            serde_json::to_string_pretty(map).context("failed to serialize progress map")?;
        fs::write(&path, content)
            .with_context(|| format!("failed to write {}", path.display()))
    }
}
