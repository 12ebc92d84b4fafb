use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;

use crate::assemble::{PART_PREFIX, PART_SUFFIX};
use crate::claim::CLAIM_SUFFIX;
use crate::session::{session_created_at, validate_session_id};

/// What one sweep pass removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub chunks: usize,
    pub temp_files: usize,
    pub claims: usize,
    pub parts: usize,
    pub errors: usize,
}

impl SweepReport {
    pub fn removed(&self) -> usize {
        self.chunks + self.temp_files + self.claims + self.parts
    }
}

/// Evicts abandoned upload state from the chunk directory.
///
/// A chunk's age is its session's age: the timestamp inside a UUIDv7
/// session id, or the file mtime for client-chosen ids. In-flight `.tmp.*`
/// writes and `.claim` records age by mtime. Chunks of a session whose
/// claim is younger than the TTL belong to a running completion and are
/// left alone.
///
/// With an output directory set, part files left behind by an interrupted
/// reassembly are reclaimed there too, aged by mtime.
#[derive(Debug, Clone)]
pub struct Sweeper {
    chunk_dir: PathBuf,
    output_dir: Option<PathBuf>,
    ttl: Duration,
}

enum Entry {
    Chunk { session_id: String },
    Temp,
    Claim { session_id: String },
}

impl Sweeper {
    pub fn new(chunk_dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            chunk_dir: chunk_dir.into(),
            output_dir: None,
            ttl,
        }
    }

    /// Also reclaims stale part files under `output_dir`.
    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(output_dir.into());
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Runs one pass, treating `now` as the current time.
    pub fn sweep(&self, now: SystemTime) -> io::Result<SweepReport> {
        let mut report = SweepReport::default();

        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.chunk_dir)? {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(error = %e, "sweep: unreadable directory entry");
                    report.errors += 1;
                    continue;
                }
            };
            let name = entry.file_name();
            let Some(kind) = name.to_str().and_then(classify_entry) else { continue };
            entries.push((entry.path(), kind));
        }

        // Sessions with a live claim are being completed right now.
        let claimed: HashSet<String> = entries
            .iter()
            .filter_map(|(path, kind)| match kind {
                Entry::Claim { session_id } if !self.expired(mtime(path), now) => {
                    Some(session_id.clone())
                }
                _ => None,
            })
            .collect();

        for (path, kind) in entries {
            let created = match &kind {
                Entry::Chunk { session_id } if claimed.contains(session_id) => continue,
                Entry::Chunk { session_id } => session_created_at(session_id).or_else(|| mtime(&path)),
                Entry::Temp | Entry::Claim { .. } => mtime(&path),
            };
            if !self.expired(created, now) {
                continue;
            }
            if remove(&path, &mut report) {
                match kind {
                    Entry::Chunk { .. } => report.chunks += 1,
                    Entry::Temp => report.temp_files += 1,
                    Entry::Claim { .. } => report.claims += 1,
                }
            }
        }

        if let Some(output_dir) = &self.output_dir {
            self.sweep_parts(output_dir, now, &mut report);
        }

        Ok(report)
    }

    /// Walks the output tree for expired reassembly part files.
    fn sweep_parts(&self, root: &Path, now: SystemTime, report: &mut SweepReport) {
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "sweep: unreadable output directory");
                    report.errors += 1;
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let Ok(file_type) = entry.file_type() else { continue };
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                let name = entry.file_name();
                let is_part = name
                    .to_str()
                    .is_some_and(|n| n.starts_with(PART_PREFIX) && n.ends_with(PART_SUFFIX));
                if is_part && self.expired(mtime(&path), now) && remove(&path, report) {
                    report.parts += 1;
                }
            }
        }
    }

    fn expired(&self, created: Option<SystemTime>, now: SystemTime) -> bool {
        created
            .and_then(|created| now.duration_since(created).ok())
            .is_some_and(|age| age > self.ttl)
    }

    /// Sweeps every `interval` until `cancel` fires.
    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let sweeper = self.clone();
            let result = tokio::task::spawn_blocking(move || sweeper.sweep(SystemTime::now())).await;
            match result {
                Ok(Ok(report)) if report.removed() > 0 || report.errors > 0 => {
                    tracing::info!(
                        chunks = report.chunks,
                        temp_files = report.temp_files,
                        claims = report.claims,
                        parts = report.parts,
                        errors = report.errors,
                        "orphan sweep finished"
                    );
                }
                Ok(Ok(_)) => tracing::debug!("orphan sweep found nothing to remove"),
                Ok(Err(e)) => {
                    tracing::error!(dir = %self.chunk_dir.display(), error = %e, "orphan sweep failed")
                }
                Err(e) => tracing::error!(error = %e, "orphan sweep task panicked"),
            }
        }

        tracing::debug!("orphan sweeper stopped");
    }
}

fn classify_entry(name: &str) -> Option<Entry> {
    if name.starts_with(".tmp.") {
        return Some(Entry::Temp);
    }
    if let Some(session_id) = name.strip_suffix(CLAIM_SUFFIX) {
        validate_session_id(session_id).ok()?;
        return Some(Entry::Claim {
            session_id: session_id.to_string(),
        });
    }
    let (session_id, index) = name.rsplit_once('_')?;
    index.parse::<u64>().ok()?;
    validate_session_id(session_id).ok()?;
    Some(Entry::Chunk {
        session_id: session_id.to_string(),
    })
}

fn mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Removes `path`, counting failures. Returns whether this call removed it.
fn remove(path: &Path, report: &mut SweepReport) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "sweep: failed to remove");
            report.errors += 1;
            false
        }
    }
}
