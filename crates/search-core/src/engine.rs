//! The engine context: the one object that owns volume indexes, change
//! monitors, and the configuration snapshot.
//!
//! Subsystems receive references instead of reaching into globals; the
//! only process-wide notion, the per-install index directory, is
//! resolved once at startup and injected here.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use anyhow::Result;
use core_types::config::{self, AppConfig};
use crossbeam_channel::{Receiver, Sender};
use ntfs_watcher::journal::{self, TailerHandle, TailerMessage};
use ntfs_watcher::{mft, paths, stat_pool, volumes, walk};
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;
use volume_index::{self as vindex, IndexStats, VolumeIndex};

use crate::orchestrator::{run_search, Scope, SearchContext};
use crate::query::parse_query;
use crate::{ChannelSink, ContentProbe, SearchMessage};

type VolumeSet = Arc<RwLock<Vec<(char, Arc<RwLock<VolumeIndex>>)>>>;

/// Cold-build progress, reported on its own channel so it never mixes
/// with a result stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildProgress {
    pub drive: char,
    pub stage: BuildStage,
    pub records: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStage {
    Enumerating,
    Reconstructing,
    Walking,
    Indexing,
    Done,
}

/// A running (or finished) search. Dropping the handle does not cancel
/// the search; starting a new one through the engine does.
pub struct SearchHandle {
    cancel: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl SearchHandle {
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Block until the worker exits (tests and CLI use this; the UI
    /// just drains the channel).
    pub fn wait(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

pub struct Engine {
    config: AppConfig,
    config_path: Option<PathBuf>,
    index_dir: PathBuf,
    system_drive: char,
    volumes: VolumeSet,
    content_probe: Option<Arc<dyn ContentProbe>>,
    event_tx: Sender<TailerMessage>,
    tailers: Vec<TailerHandle>,
    /// Volumes whose journal rotated; they serve stale reads until
    /// rebuilt.
    rebuild_pending: Arc<Mutex<Vec<char>>>,
    current_search: Option<SearchHandle>,
    progress: Option<Sender<BuildProgress>>,
    _mutator: JoinHandle<()>,
}

impl Engine {
    /// Create an engine over a config snapshot. `config_path` enables
    /// history/tunable persistence; `index_dir` holds the per-volume
    /// `<drive>.bin` files.
    pub fn new(config: AppConfig, config_path: Option<PathBuf>, index_dir: PathBuf) -> Self {
        let volumes: VolumeSet = Arc::new(RwLock::new(Vec::new()));
        let rebuild_pending = Arc::new(Mutex::new(Vec::new()));
        let (event_tx, event_rx) = crossbeam_channel::unbounded();

        let allowed = lowered_roots(&config);
        let mutator = spawn_mutator(
            event_rx,
            volumes.clone(),
            rebuild_pending.clone(),
            allowed,
        );

        Self {
            config,
            config_path,
            index_dir,
            system_drive: 'C',
            volumes,
            content_probe: None,
            event_tx,
            tailers: Vec::new(),
            rebuild_pending,
            current_search: None,
            progress: None,
            _mutator: mutator,
        }
    }

    pub fn set_content_probe(&mut self, probe: Arc<dyn ContentProbe>) {
        self.content_probe = Some(probe);
    }

    /// Subscribe to cold-build progress.
    pub fn set_progress_channel(&mut self, tx: Sender<BuildProgress>) {
        self.progress = Some(tx);
    }

    fn report(&self, drive: char, stage: BuildStage, records: usize) {
        if let Some(tx) = &self.progress {
            let _ = tx.send(BuildProgress {
                drive,
                stage,
                records,
            });
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Load every persisted index under the index directory. Corrupt or
    /// incompatible files are deleted; the volume rebuilds on demand.
    pub fn load_persisted(&mut self) {
        for descriptor in volumes::discover_volumes() {
            let path = config::index_file_path(&self.index_dir, descriptor.drive);
            if path.exists() {
                self.load_one(descriptor.drive, &path);
            }
        }
        // Off-Windows (or with no discovery), fall back to whatever
        // index files exist on disk.
        if let Ok(entries) = std::fs::read_dir(&self.index_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                let Some(stem) = name.strip_suffix(".bin") else {
                    continue;
                };
                let mut chars = stem.chars();
                let (Some(drive), None) = (chars.next(), chars.next()) else {
                    continue;
                };
                if self.volume(drive.to_ascii_uppercase()).is_none() {
                    self.load_one(drive.to_ascii_uppercase(), &entry.path());
                }
            }
        }
    }

    fn load_one(&mut self, drive: char, path: &std::path::Path) {
        match vindex::load_index(path) {
            Ok(index) => {
                info!(volume = %drive, records = index.live_count(), "loaded persisted index");
                self.install_volume(drive, index);
                self.start_monitor(drive);
            }
            Err(err) => {
                warn!(volume = %drive, error = %err, "discarding unusable index file");
                let _ = std::fs::remove_file(path);
            }
        }
    }

    pub fn volume(&self, drive: char) -> Option<Arc<RwLock<VolumeIndex>>> {
        self.volumes
            .read()
            .iter()
            .find(|(d, _)| *d == drive)
            .map(|(_, lock)| lock.clone())
    }

    pub fn drives(&self) -> Vec<char> {
        self.volumes.read().iter().map(|(d, _)| *d).collect()
    }

    pub fn stats(&self) -> Vec<IndexStats> {
        self.volumes
            .read()
            .iter()
            .map(|(_, lock)| lock.read().stats())
            .collect()
    }

    /// Volumes whose journal rotated since the last call; each needs a
    /// rebuild and serves stale results until it gets one.
    pub fn take_rebuild_pending(&self) -> Vec<char> {
        std::mem::take(&mut *self.rebuild_pending.lock())
    }

    fn install_volume(&self, drive: char, index: VolumeIndex) {
        let mut set = self.volumes.write();
        match set.iter_mut().find(|(d, _)| *d == drive) {
            Some((_, slot)) => *slot = Arc::new(RwLock::new(index)),
            None => set.push((drive, Arc::new(RwLock::new(index)))),
        }
    }

    fn allow_roots_for(&self, drive: char) -> Option<Vec<String>> {
        (drive == self.system_drive).then(|| lowered_roots(&self.config))
    }

    /// Cold-build (or rebuild) one volume. Prefers the native MFT path;
    /// any enumeration failure falls back to the recursive walk with
    /// the same skip rules.
    pub fn build_volume(&mut self, drive: char) -> Result<()> {
        let drive = drive.to_ascii_uppercase();
        let started = Instant::now();
        let allow = self.allow_roots_for(drive);

        self.report(drive, BuildStage::Enumerating, 0);
        let index = match mft::enumerate_volume(drive) {
            Ok(raw) => {
                info!(volume = %drive, records = raw.len(), "native enumeration complete");
                self.report(drive, BuildStage::Reconstructing, raw.len());
                let reconstructed = paths::reconstruct(drive, raw, allow.as_deref());
                self.report(drive, BuildStage::Indexing, reconstructed.records.len());
                let mut index = VolumeIndex::from_records(drive, reconstructed.records);
                if let Ok(cursor) = journal::query_cursor(drive) {
                    index.usn_journal_id = cursor.journal_id;
                    index.last_usn = cursor.last_usn;
                }
                self.finish_build(&mut index, started);
                self.install_volume(drive, index);
                self.start_monitor_with(drive, reconstructed.dir_paths);
                self.volume(drive)
            }
            Err(err) => {
                warn!(volume = %drive, error = %err, "native enumeration unavailable; walking");
                let roots = match &allow {
                    Some(roots) => roots.clone(),
                    None => vec![volumes::drive_root(drive)],
                };
                self.build_volume_from_roots(drive, &roots)?;
                self.volume(drive)
            }
        };

        // Eager metadata backfill in the background once indexing
        // completes.
        if let Some(lock) = index {
            let records = lock.read().live_count();
            self.report(drive, BuildStage::Done, records);
            spawn_background_backfill(drive, lock);
        }
        Ok(())
    }

    /// Walk-based build over explicit roots. Also the whole story on
    /// non-NTFS hosts, where the change monitor stays inert and the
    /// index is built once per session.
    pub fn build_volume_from_roots(&mut self, drive: char, roots: &[String]) -> Result<()> {
        let drive = drive.to_ascii_uppercase();
        let started = Instant::now();
        let allow = self.allow_roots_for(drive);

        self.report(drive, BuildStage::Walking, 0);
        let mut records = Vec::new();
        for root in roots {
            records.extend(walk::walk_volume(root, allow.as_deref()));
        }
        info!(volume = %drive, records = records.len(), "walk build complete");

        self.report(drive, BuildStage::Indexing, records.len());
        let count = records.len();
        let mut index = VolumeIndex::from_records(drive, records);
        self.finish_build(&mut index, started);
        self.install_volume(drive, index);
        self.report(drive, BuildStage::Done, count);
        Ok(())
    }

    fn finish_build(&self, index: &mut VolumeIndex, started: Instant) {
        index.built_at = vindex::now_epoch();
        index.build_duration = started.elapsed().as_secs_f64();
    }

    fn start_monitor(&mut self, drive: char) {
        // A loaded index has no FRN map; a cheap dirs-only enumeration
        // reseeds it. Off-Windows this fails fast and the monitor stays
        // inert.
        match mft::enumerate_volume(drive) {
            Ok(raw) => {
                let allow = self.allow_roots_for(drive);
                let reconstructed = paths::reconstruct(drive, raw, allow.as_deref());
                self.start_monitor_with(drive, reconstructed.dir_paths);
            }
            Err(_) => {
                info!(volume = %drive, "change monitor inert for this volume");
            }
        }
    }

    fn start_monitor_with(&mut self, drive: char, dir_paths: ahash::AHashMap<u64, String>) {
        let cursor = {
            let Some(lock) = self.volume(drive) else {
                return;
            };
            let idx = lock.read();
            ntfs_watcher::JournalCursor {
                journal_id: idx.usn_journal_id,
                last_usn: idx.last_usn,
            }
        };
        match journal::spawn_tailer(drive, cursor, dir_paths, self.event_tx.clone()) {
            Ok(handle) => {
                info!(volume = %drive, "usn tailer running");
                self.tailers.push(handle);
            }
            Err(err) => {
                info!(volume = %drive, error = %err, "change monitor unavailable");
            }
        }
    }

    /// Run a query. Implicitly cancels any in-flight search, records the
    /// string in the history, and returns the result stream plus a
    /// handle for explicit cancellation.
    pub fn search(
        &mut self,
        raw_query: &str,
        scope: Scope,
    ) -> (SearchHandle, Receiver<SearchMessage>) {
        if let Some(prev) = self.current_search.take() {
            prev.cancel();
        }

        // Ensure every scoped volume is available: load the persisted
        // index if one exists, cold-build discovered volumes otherwise.
        for (drive, _) in scope.resolve() {
            if self.volume(drive).is_some() {
                continue;
            }
            let path = config::index_file_path(&self.index_dir, drive);
            if path.exists() {
                self.load_one(drive, &path);
            } else if volumes::discover_volumes().iter().any(|v| v.drive == drive) {
                if let Err(err) = self.build_volume(drive) {
                    warn!(volume = %drive, error = %err, "on-demand build failed");
                }
            }
        }

        self.config.add_history(raw_query);
        if let Some(path) = &self.config_path {
            if let Err(err) = self.config.save(path) {
                warn!(error = %err, "failed to persist search history");
            }
        }

        let (tx, rx) = crossbeam_channel::unbounded();
        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_flag = cancel.clone();

        let volumes = self.volumes.read().clone();
        let everything_mode = self.config.everything_mode;
        let batch_size = self.config.results_page_size;
        let allowed_roots_lower = lowered_roots(&self.config);
        let system_drive = self.system_drive;
        let content_probe = self.content_probe.clone();
        let query = parse_query(raw_query, vindex::now_epoch());
        let search_id = Uuid::new_v4();

        let join = std::thread::Builder::new()
            .name("search-worker".into())
            .spawn(move || {
                let ctx = SearchContext {
                    volumes: &volumes,
                    everything_mode,
                    system_drive,
                    allowed_roots_lower,
                    content_probe,
                    batch_size,
                };
                let sink = ChannelSink::new(tx);
                run_search(&ctx, &query, &scope, &cancel_flag, &sink, search_id);
            })
            .ok();

        let handle = SearchHandle {
            cancel: cancel.clone(),
            join,
        };
        self.current_search = Some(SearchHandle {
            cancel,
            join: None,
        });
        (handle, rx)
    }

    /// Test/embedding hook: feed a change batch as if a tailer had
    /// produced it.
    pub fn inject_events(&self, message: TailerMessage) {
        let _ = self.event_tx.send(message);
    }

    /// Persist one volume to its well-known file.
    pub fn save_volume(&self, drive: char) -> Result<()> {
        let Some(lock) = self.volume(drive) else {
            anyhow::bail!("volume {drive}: is not loaded");
        };
        let path = config::index_file_path(&self.index_dir, drive);
        let idx = lock.read();
        vindex::save_index(&idx, &path)?;
        Ok(())
    }

    /// Drop a volume's in-memory index and its persisted file. The next
    /// startup (or an explicit build) rebuilds from scratch.
    pub fn purge_volume(&mut self, drive: char) -> Result<()> {
        self.volumes.write().retain(|(d, _)| *d != drive);
        let path = config::index_file_path(&self.index_dir, drive);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// Graceful shutdown: cancel the in-flight search, stop tailers,
    /// persist every index and the config.
    pub fn shutdown(&mut self) {
        if let Some(search) = self.current_search.take() {
            search.cancel();
        }
        for tailer in self.tailers.drain(..) {
            tailer.stop();
        }
        for drive in self.drives() {
            if let Err(err) = self.save_volume(drive) {
                warn!(volume = %drive, error = %err, "failed to persist index");
            }
        }
        if let Some(path) = &self.config_path {
            if let Err(err) = self.config.save(path) {
                warn!(error = %err, "failed to persist config");
            }
        }
    }
}

fn lowered_roots(config: &AppConfig) -> Vec<String> {
    config
        .enabled_scan_roots()
        .into_iter()
        .map(|r| r.to_lowercase().trim_end_matches(['\\', '/']).to_string())
        .collect()
}

/// The mutator thread: applies tailer batches to the owning volume
/// under its writer lock, and records rotation/disappearance signals.
fn spawn_mutator(
    rx: Receiver<TailerMessage>,
    volumes: VolumeSet,
    rebuild_pending: Arc<Mutex<Vec<char>>>,
    allowed_roots_lower: Vec<String>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("index-mutator".into())
        .spawn(move || {
            while let Ok(message) = rx.recv() {
                match message {
                    TailerMessage::Batch { drive, events } => {
                        let lock = volumes
                            .read()
                            .iter()
                            .find(|(d, _)| *d == drive)
                            .map(|(_, l)| l.clone());
                        let Some(lock) = lock else {
                            continue;
                        };
                        let allow =
                            (drive == 'C' && !allowed_roots_lower.is_empty())
                                .then_some(allowed_roots_lower.as_slice());
                        let mut idx = lock.write();
                        vindex::apply_events(&mut idx, &events, allow);
                    }
                    TailerMessage::Rotated { drive, stored, current } => {
                        warn!(volume = %drive, stored, current,
                              "journal rotated; volume serves stale reads until rebuilt");
                        rebuild_pending.lock().push(drive);
                    }
                    TailerMessage::Gone { drive } => {
                        warn!(volume = %drive, "volume gone; excluding from searches");
                        volumes.write().retain(|(d, _)| *d != drive);
                    }
                }
            }
        })
        .unwrap_or_else(|err| {
            // Thread spawn only fails under resource exhaustion; without
            // a mutator the engine cannot honor its freshness contract.
            panic!("failed to spawn index mutator: {err}")
        })
}

/// Background eager backfill: stat zero-metadata records in chunks and
/// write the results back without starving readers.
fn spawn_background_backfill(drive: char, lock: Arc<RwLock<VolumeIndex>>) {
    let builder = std::thread::Builder::new().name(format!("backfill-{drive}"));
    let spawned = builder.spawn(move || {
        let needy: Vec<(core_types::RecordId, String)> = {
            let idx = lock.read();
            idx.iter_live()
                .filter(|(_, r)| r.mtime == 0.0)
                .map(|(id, r)| (id, r.full_path.clone()))
                .collect()
        };
        if needy.is_empty() {
            return;
        }
        info!(volume = %drive, records = needy.len(), "background metadata backfill started");

        for chunk in needy.chunks(2_000) {
            let paths: Vec<String> = chunk.iter().map(|(_, p)| p.clone()).collect();
            let stats = stat_pool::stat_paths(&paths);
            let mut idx = lock.write();
            for ((id, _), stat) in chunk.iter().zip(stats) {
                let Some((size, mtime)) = stat else { continue };
                if let Some(rec) = idx.fetch(*id) {
                    let mut fresh = rec.clone();
                    if !fresh.is_dir {
                        fresh.size = size;
                    }
                    fresh.mtime = mtime;
                    idx.update(*id, fresh);
                }
            }
        }
        info!(volume = %drive, "background metadata backfill finished");
    });
    if let Err(err) = spawned {
        warn!(volume = %drive, error = %err, "could not start backfill thread");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::{ChangeEvent, ChangeKind, FileRecord};
    use std::time::Duration;

    fn test_engine() -> (Engine, tempfile::TempDir) {
        let tmp = tempfile::tempdir().expect("tempdir");
        let engine = Engine::new(AppConfig::default(), None, tmp.path().join("index"));
        (engine, tmp)
    }

    fn drain_names(rx: &Receiver<SearchMessage>) -> Vec<String> {
        let mut names = Vec::new();
        while let Ok(message) = rx.recv_timeout(Duration::from_secs(5)) {
            match message {
                SearchMessage::Batch(b) => {
                    names.extend(b.records.into_iter().map(|r| r.name));
                }
                SearchMessage::Finished(_) | SearchMessage::Error(_) => break,
            }
        }
        names
    }

    fn seed_volume(engine: &Engine, drive: char, records: Vec<FileRecord>) {
        engine.install_volume(drive, VolumeIndex::from_records(drive, records));
    }

    #[test]
    fn end_to_end_search_through_the_engine() {
        let (mut engine, _tmp) = test_engine();
        let root = format!("D:{}", core_types::SEP);
        seed_volume(
            &engine,
            'D',
            vec![
                FileRecord::new("alpha.txt", &root, false, 1, 1.0),
                FileRecord::new("beta.md", &root, false, 1, 2.0),
            ],
        );

        let (mut handle, rx) = engine.search("alpha", Scope::drives(['D']));
        handle.wait();
        assert_eq!(drain_names(&rx), vec!["alpha.txt"]);
    }

    #[test]
    fn new_search_cancels_the_previous_one() {
        let (mut engine, _tmp) = test_engine();
        let root = format!("D:{}", core_types::SEP);
        seed_volume(
            &engine,
            'D',
            vec![FileRecord::new("a.txt", &root, false, 1, 1.0)],
        );

        let (first, _rx1) = engine.search("a", Scope::drives(['D']));
        let (mut second, rx2) = engine.search("a", Scope::drives(['D']));
        assert!(first.cancel.load(Ordering::Relaxed));
        second.wait();
        assert_eq!(drain_names(&rx2), vec!["a.txt"]);
    }

    #[test]
    fn build_progress_arrives_on_its_own_channel() {
        let (mut engine, tmp) = test_engine();
        let (tx, rx) = crossbeam_channel::unbounded();
        engine.set_progress_channel(tx);

        let data = tmp.path().join("data");
        std::fs::create_dir_all(&data).unwrap();
        std::fs::write(data.join("one.txt"), b"1").unwrap();
        engine
            .build_volume_from_roots('D', &[data.to_string_lossy().into_owned()])
            .unwrap();

        let stages: Vec<BuildStage> = rx.try_iter().map(|p| p.stage).collect();
        assert_eq!(
            stages,
            vec![BuildStage::Walking, BuildStage::Indexing, BuildStage::Done]
        );
    }

    #[test]
    fn walk_build_and_search() {
        let (mut engine, tmp) = test_engine();
        let data = tmp.path().join("data");
        std::fs::create_dir_all(data.join("sub")).unwrap();
        std::fs::write(data.join("report.txt"), b"x").unwrap();
        std::fs::write(data.join("sub").join("notes.md"), b"y").unwrap();

        engine
            .build_volume_from_roots('D', &[data.to_string_lossy().into_owned()])
            .unwrap();

        let stats = engine.stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].records, 3); // sub, report.txt, notes.md
        assert!(stats[0].built_at > 0.0);

        let (mut handle, rx) = engine.search("notes", Scope::drives(['D']));
        handle.wait();
        assert_eq!(drain_names(&rx), vec!["notes.md"]);
    }

    #[test]
    fn deletion_propagates_within_the_freshness_bound() {
        let (mut engine, tmp) = test_engine();
        let work = tmp.path().join("work");
        std::fs::create_dir_all(&work).unwrap();
        let notes = work.join("notes.txt");
        std::fs::write(&notes, b"z").unwrap();

        engine
            .build_volume_from_roots('D', &[tmp.path().to_string_lossy().into_owned()])
            .unwrap();

        std::fs::remove_file(&notes).unwrap();
        engine.inject_events(TailerMessage::Batch {
            drive: 'D',
            events: vec![ChangeEvent {
                kind: ChangeKind::Deleted,
                path: notes.to_string_lossy().into_owned(),
                is_dir: false,
                usn: 100,
            }],
        });

        // The index must reflect the deletion well within 2 s.
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let (mut handle, rx) = engine.search("notes.txt", Scope::drives(['D']));
            handle.wait();
            if drain_names(&rx).is_empty() {
                break;
            }
            assert!(Instant::now() < deadline, "deletion did not propagate in time");
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn rename_propagates_as_delete_plus_create() {
        let (mut engine, tmp) = test_engine();
        let a = tmp.path().join("a.txt");
        std::fs::write(&a, b"1").unwrap();

        engine
            .build_volume_from_roots('D', &[tmp.path().to_string_lossy().into_owned()])
            .unwrap();

        let b = tmp.path().join("b.txt");
        std::fs::rename(&a, &b).unwrap();
        engine.inject_events(TailerMessage::Batch {
            drive: 'D',
            events: vec![
                ChangeEvent {
                    kind: ChangeKind::Deleted,
                    path: a.to_string_lossy().into_owned(),
                    is_dir: false,
                    usn: 7,
                },
                ChangeEvent {
                    kind: ChangeKind::Created,
                    path: b.to_string_lossy().into_owned(),
                    is_dir: false,
                    usn: 8,
                },
            ],
        });

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let (mut h1, rx1) = engine.search("a.txt", Scope::drives(['D']));
            h1.wait();
            let gone = drain_names(&rx1).is_empty();
            let (mut h2, rx2) = engine.search("b.txt", Scope::drives(['D']));
            h2.wait();
            let present = drain_names(&rx2) == vec!["b.txt"];
            if gone && present {
                break;
            }
            assert!(Instant::now() < deadline, "rename did not propagate in time");
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn purge_removes_the_index_and_its_file() {
        let (mut engine, tmp) = test_engine();
        let root = format!("D:{}", core_types::SEP);
        seed_volume(
            &engine,
            'D',
            vec![FileRecord::new("persisted.txt", &root, false, 1, 1.0)],
        );
        engine.save_volume('D').unwrap();
        let file = config::index_file_path(&tmp.path().join("index"), 'D');
        assert!(file.exists());

        engine.purge_volume('D').unwrap();
        assert!(engine.drives().is_empty());
        assert!(!file.exists(), "purging deletes the persisted file");
    }

    #[test]
    fn persisted_volume_survives_restart() {
        let (mut engine, tmp) = test_engine();
        let root = format!("D:{}", core_types::SEP);
        seed_volume(
            &engine,
            'D',
            vec![FileRecord::new("persisted.txt", &root, false, 1, 1.0)],
        );
        engine.save_volume('D').unwrap();
        engine.shutdown();

        let mut fresh = Engine::new(AppConfig::default(), None, tmp.path().join("index"));
        fresh.load_persisted();
        assert_eq!(fresh.drives(), vec!['D']);
        let (mut handle, rx) = fresh.search("persisted", Scope::drives(['D']));
        handle.wait();
        assert_eq!(drain_names(&rx), vec!["persisted.txt"]);
    }

    #[test]
    fn corrupt_index_file_is_discarded_on_load() {
        let (engine, tmp) = test_engine();
        drop(engine);
        let index_dir = tmp.path().join("index");
        std::fs::create_dir_all(&index_dir).unwrap();
        let path = index_dir.join("D.bin");
        std::fs::write(&path, b"VIDXgarbage-not-a-real-index").unwrap();

        let mut fresh = Engine::new(AppConfig::default(), None, index_dir);
        fresh.load_persisted();
        assert!(fresh.drives().is_empty());
        assert!(!path.exists(), "corrupt file is deleted to trigger rebuild");
    }

    #[test]
    fn rotation_signal_queues_a_rebuild() {
        let (engine, _tmp) = test_engine();
        seed_volume(&engine, 'D', Vec::new());
        engine.inject_events(TailerMessage::Rotated {
            drive: 'D',
            stored: 1,
            current: 2,
        });
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let pending = engine.take_rebuild_pending();
            if pending == vec!['D'] {
                break;
            }
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn gone_volume_is_excluded() {
        let (engine, _tmp) = test_engine();
        seed_volume(&engine, 'D', Vec::new());
        engine.inject_events(TailerMessage::Gone { drive: 'D' });
        let deadline = Instant::now() + Duration::from_secs(2);
        while !engine.drives().is_empty() {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
