//! Polling change detection for the watched source tree.
//!
//! A `ChangeScanner` walks the whole tree on every cycle and compares each
//! entry's modification time with the last observation point. There is no
//! file index between cycles, so the cost of a cycle grows with the size of
//! the tree; this is meant for developer source trees, not large data
//! directories.
//!
//! Once a change is seen, the observation point moves to the wall-clock time
//! of detection rather than to the file's own mtime. Files touched by a single
//! save therefore collapse into one change event.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::{DirEntry, WalkBuilder};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::SetupError;
use crate::events::ChangeEvent;

/// Default delay between two scans.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

const VCS_DIRS: &[&str] = &[".git", ".hg", ".svn"];

/// Source of wall-clock time and of the pause between scans.
pub trait Clock {
    fn now(&self) -> SystemTime;
    fn sleep(&self, duration: Duration);
}

/// The real clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Decides which entries are left out of change detection.
#[derive(Debug, Clone)]
pub struct IgnorePolicy {
    skip_vcs: bool,
    patterns: Vec<String>,
    globset: Option<GlobSet>,
}

impl IgnorePolicy {
    /// Builds a policy from base-name globs. Empty patterns are dropped.
    pub fn new(patterns: &[String], skip_vcs: bool) -> Result<Self, SetupError> {
        let patterns: Vec<String> = patterns
            .iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        let globset = if patterns.is_empty() {
            None
        } else {
            let mut builder = GlobSetBuilder::new();
            for pattern in &patterns {
                let glob = Glob::new(pattern).map_err(|source| SetupError::IgnorePattern {
                    pattern: pattern.clone(),
                    source,
                })?;
                builder.add(glob);
            }
            let set = builder.build().map_err(|source| SetupError::IgnorePattern {
                pattern: patterns.join(", "),
                source,
            })?;
            Some(set)
        };
        Ok(Self {
            skip_vcs,
            patterns,
            globset,
        })
    }

    /// The configured glob patterns.
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Whether version-control directories are skipped.
    pub fn skips_vcs(&self) -> bool {
        self.skip_vcs
    }

    /// Whether an entry with this base name is excluded.
    ///
    /// Version-control names only apply to directories; globs apply to both
    /// files and directories. An excluded directory is never descended into.
    pub fn excludes(&self, name: &OsStr, is_dir: bool) -> bool {
        if is_dir && self.skip_vcs && VCS_DIRS.iter().any(|vcs| OsStr::new(vcs) == name) {
            return true;
        }
        match &self.globset {
            Some(globset) => globset.is_match(Path::new(name)),
            None => false,
        }
    }

    fn excludes_entry(&self, entry: &DirEntry) -> bool {
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        self.excludes(entry.file_name(), is_dir)
    }
}

/// The directory tree being watched.
#[derive(Debug, Clone)]
pub struct WatchTarget {
    root: PathBuf,
    policy: IgnorePolicy,
}

impl WatchTarget {
    /// Resolves `root` to an absolute path and checks it can be listed.
    pub fn new(root: &Path, policy: IgnorePolicy) -> Result<Self, SetupError> {
        let to_error = |source| SetupError::WatchRoot {
            path: root.to_path_buf(),
            source,
        };
        let root = root.canonicalize().map_err(to_error)?;
        std::fs::read_dir(&root).map_err(to_error)?;
        Ok(Self { root, policy })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn policy(&self) -> &IgnorePolicy {
        &self.policy
    }
}

/// Outcome of a single pass over the tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Clock time at which the first newer entry was seen.
    pub detected_at: Option<SystemTime>,
    /// Entries whose mtime is after the observation point.
    pub modified: usize,
    /// Entries that could not be read; the walk carries on past them.
    pub skipped: usize,
}

/// Walks `target` once and reports entries modified strictly after `since`.
pub fn scan_tree<C>(target: &WatchTarget, since: SystemTime, clock: &C) -> ScanReport
where
    C: Clock + ?Sized,
{
    let policy = target.policy.clone();
    let walker = WalkBuilder::new(&target.root)
        .standard_filters(false)
        .follow_links(false)
        .filter_entry(move |entry| entry.depth() == 0 || !policy.excludes_entry(entry))
        .build();

    let mut report = ScanReport::default();
    for entry in walker {
        let mtime = entry
            .ok()
            .and_then(|entry| entry.metadata().ok())
            .and_then(|meta| meta.modified().ok());
        report.record(mtime, since, clock);
    }
    report
}

impl ScanReport {
    /// Accounts for one walked entry; `None` means it could not be inspected.
    fn record<C>(&mut self, mtime: Option<SystemTime>, since: SystemTime, clock: &C)
    where
        C: Clock + ?Sized,
    {
        match mtime {
            None => self.skipped += 1,
            Some(mtime) if mtime > since => {
                self.modified += 1;
                if self.detected_at.is_none() {
                    self.detected_at = Some(clock.now());
                }
            }
            Some(_) => {}
        }
    }
}

/// Polls a `WatchTarget`, remembering when it last saw a change.
pub struct ChangeScanner<C = SystemClock> {
    target: WatchTarget,
    interval: Duration,
    clock: C,
    since: SystemTime,
}

impl<C: Clock> ChangeScanner<C> {
    /// Creates a scanner whose first observation point is the current time.
    pub fn new(target: WatchTarget, interval: Duration, clock: C) -> Self {
        let since = clock.now();
        Self {
            target,
            interval,
            clock,
            since,
        }
    }

    /// The current observation point.
    #[cfg(test)]
    pub fn since(&self) -> SystemTime {
        self.since
    }

    /// Runs one pass and moves the observation point forward on change.
    pub fn scan(&mut self) -> ScanReport {
        let report = scan_tree(&self.target, self.since, &self.clock);
        if let Some(at) = report.detected_at {
            self.since = at;
        }
        report
    }

    /// Turns the scanner into an endless stream of change events.
    pub fn changes(self) -> Changes<C> {
        Changes {
            scanner: self,
            primed: false,
        }
    }
}

/// Infinite iterator yielding one `ChangeEvent` per detected batch.
///
/// Each call to `next` blocks, scanning once per poll interval, until a pass
/// sees a change.
pub struct Changes<C> {
    scanner: ChangeScanner<C>,
    primed: bool,
}

impl<C: Clock> Iterator for Changes<C> {
    type Item = ChangeEvent;

    fn next(&mut self) -> Option<ChangeEvent> {
        loop {
            if self.primed {
                self.scanner.clock.sleep(self.scanner.interval);
            }
            self.primed = true;
            let report = self.scanner.scan();
            if let Some(detected_at) = report.detected_at {
                return Some(ChangeEvent {
                    detected_at,
                    modified: report.modified,
                    skipped: report.skipped,
                });
            }
        }
    }
}

/// Runs the scanner on a background thread.
///
/// Events go to `tx`; while one is still waiting to be consumed, further
/// events are folded into it.
pub fn spawn_scanner<C>(scanner: ChangeScanner<C>, tx: mpsc::Sender<ChangeEvent>) -> std::thread::JoinHandle<()>
where
    C: Clock + Send + 'static,
{
    std::thread::spawn(move || forward(scanner.changes(), &tx))
}

fn forward<I>(events: I, tx: &mpsc::Sender<ChangeEvent>)
where
    I: Iterator<Item = ChangeEvent>,
{
    for event in events {
        match tx.try_send(event) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Closed(_)) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Clone)]
    struct ManualClock(Arc<Mutex<SystemTime>>);

    impl ManualClock {
        fn at(time: SystemTime) -> Self {
            Self(Arc::new(Mutex::new(time)))
        }

        fn advance(&self, by: Duration) {
            *self.0.lock().unwrap() += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> SystemTime {
            *self.0.lock().unwrap()
        }

        fn sleep(&self, duration: Duration) {
            self.advance(duration);
        }
    }

    fn set_mtime(path: &Path, time: SystemTime) {
        let file = if path.is_dir() {
            File::open(path).unwrap()
        } else {
            File::options().write(true).open(path).unwrap()
        };
        file.set_modified(time).unwrap();
    }

    // Stamps every entry below and including `root`.
    fn stamp_tree(root: &Path, time: SystemTime) {
        for entry in std::fs::read_dir(root).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stamp_tree(&path, time);
            } else {
                set_mtime(&path, time);
            }
        }
        set_mtime(root, time);
    }

    fn write(root: &Path, rel: &str) -> PathBuf {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, rel).unwrap();
        path
    }

    fn an_hour_ago() -> SystemTime {
        SystemTime::now() - Duration::from_secs(3600)
    }

    #[test]
    fn policy_skips_vcs_directories_only() {
        let policy = IgnorePolicy::new(&[], true).unwrap();
        assert!(policy.excludes(OsStr::new(".git"), true));
        assert!(policy.excludes(OsStr::new(".hg"), true));
        assert!(!policy.excludes(OsStr::new(".git"), false));
        assert!(!policy.excludes(OsStr::new("src"), true));

        let policy = IgnorePolicy::new(&[], false).unwrap();
        assert!(!policy.excludes(OsStr::new(".git"), true));
    }

    #[test]
    fn policy_matches_globs_against_base_names() {
        let patterns = vec!["*.tmp".to_string(), "".to_string(), "vendor".to_string()];
        let policy = IgnorePolicy::new(&patterns, true).unwrap();
        assert_eq!(policy.patterns(), ["*.tmp".to_string(), "vendor".to_string()]);
        assert!(policy.excludes(OsStr::new("main.go.tmp"), false));
        assert!(policy.excludes(OsStr::new("vendor"), true));
        assert!(!policy.excludes(OsStr::new("main.go"), false));
    }

    #[test]
    fn invalid_glob_is_a_setup_error() {
        let err = IgnorePolicy::new(&["a[".to_string()], true).unwrap_err();
        assert!(matches!(err, SetupError::IgnorePattern { .. }));
    }

    #[test]
    fn watch_target_rejects_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let policy = IgnorePolicy::new(&[], true).unwrap();
        let err = WatchTarget::new(&dir.path().join("missing"), policy).unwrap_err();
        assert!(matches!(err, SetupError::WatchRoot { .. }));
    }

    #[test]
    fn vcs_metadata_is_ignored_and_detection_time_becomes_the_bar() {
        let dir = tempfile::tempdir().unwrap();
        let main_go = write(dir.path(), "main.go");
        let head = write(dir.path(), ".git/HEAD");
        let t0 = an_hour_ago();
        stamp_tree(dir.path(), t0);
        set_mtime(&head, t0 + Duration::from_secs(60));
        set_mtime(&dir.path().join(".git"), t0 + Duration::from_secs(60));

        let target = WatchTarget::new(dir.path(), IgnorePolicy::new(&[], true).unwrap()).unwrap();
        let clock = ManualClock::at(SystemTime::now());

        let report = scan_tree(&target, t0, &clock);
        assert!(report.detected_at.is_none());
        assert_eq!(report.skipped, 0);

        set_mtime(&main_go, t0 + Duration::from_secs(120));
        let report = scan_tree(&target, t0, &clock);
        assert!(report.detected_at.is_some());
        assert_eq!(report.modified, 1);
        let detected_at = report.detected_at.unwrap();
        assert_eq!(detected_at, clock.now());

        assert!(scan_tree(&target, detected_at, &clock).detected_at.is_none());
    }

    #[test]
    fn nothing_inside_an_excluded_directory_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "main.go");
        let deep = write(dir.path(), ".git/objects/ab/cdef");
        let vendored = write(dir.path(), "vendor/lib/lib.go");
        let scratch = write(dir.path(), "notes.tmp");
        let t0 = an_hour_ago();
        stamp_tree(dir.path(), t0);

        let later = t0 + Duration::from_secs(30);
        set_mtime(&deep, later);
        set_mtime(&vendored, later);
        set_mtime(&scratch, later);
        set_mtime(&dir.path().join("vendor/lib"), later);
        set_mtime(&dir.path().join(".git/objects/ab"), later);

        let patterns = vec!["vendor".to_string(), "*.tmp".to_string()];
        let target = WatchTarget::new(dir.path(), IgnorePolicy::new(&patterns, true).unwrap()).unwrap();
        let clock = ManualClock::at(SystemTime::now());
        assert!(scan_tree(&target, t0, &clock).detected_at.is_none());

        let open = WatchTarget::new(dir.path(), IgnorePolicy::new(&[], false).unwrap()).unwrap();
        assert_eq!(scan_tree(&open, t0, &clock).modified, 5);
    }

    #[test]
    fn a_burst_of_writes_is_one_change() {
        let dir = tempfile::tempdir().unwrap();
        let files: Vec<PathBuf> = ["a.go", "b.go", "pkg/c.go"]
            .iter()
            .map(|rel| write(dir.path(), rel))
            .collect();
        let base = an_hour_ago();
        stamp_tree(dir.path(), base - Duration::from_secs(1));

        let clock = ManualClock::at(base);
        let target = WatchTarget::new(dir.path(), IgnorePolicy::new(&[], true).unwrap()).unwrap();
        let mut scanner = ChangeScanner::new(target, DEFAULT_POLL_INTERVAL, clock.clone());
        assert_eq!(scanner.since(), base);

        for (i, file) in files.iter().enumerate() {
            set_mtime(file, base + Duration::from_millis(100 * (i as u64 + 1)));
        }
        clock.advance(DEFAULT_POLL_INTERVAL);

        let first = scanner.scan();
        assert!(first.detected_at.is_some());
        assert_eq!(first.modified, 3);
        assert_eq!(scanner.since(), base + DEFAULT_POLL_INTERVAL);

        clock.advance(DEFAULT_POLL_INTERVAL);
        assert!(scanner.scan().detected_at.is_none());
    }

    #[test]
    fn changes_yields_one_event_per_batch() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "a.go");
        let b = write(dir.path(), "b.go");
        let base = an_hour_ago();
        stamp_tree(dir.path(), base - Duration::from_secs(1));

        let clock = ManualClock::at(base);
        let target = WatchTarget::new(dir.path(), IgnorePolicy::new(&[], true).unwrap()).unwrap();
        let mut changes = ChangeScanner::new(target, DEFAULT_POLL_INTERVAL, clock.clone()).changes();

        set_mtime(&a, base + Duration::from_millis(10));
        set_mtime(&b, base + Duration::from_millis(20));
        clock.advance(Duration::from_millis(50));
        let first = changes.next().unwrap();
        assert_eq!(first.modified, 2);
        assert_eq!(first.detected_at, base + Duration::from_millis(50));

        // Edited while the next sleep is in progress.
        set_mtime(&a, base + Duration::from_millis(300));
        let second = changes.next().unwrap();
        assert_eq!(second.modified, 1);
        assert_eq!(second.detected_at, base + Duration::from_millis(550));
    }

    #[test]
    fn unreadable_entries_are_counted_and_passed_over() {
        let since = an_hour_ago();
        let clock = ManualClock::at(SystemTime::now());
        let mut report = ScanReport::default();
        report.record(None, since, &clock);
        report.record(Some(since), since, &clock);
        report.record(None, since, &clock);
        report.record(Some(since + Duration::from_secs(1)), since, &clock);

        assert_eq!(report.skipped, 2);
        assert_eq!(report.modified, 1);
        assert_eq!(report.detected_at, Some(clock.now()));
    }

    #[cfg(unix)]
    #[test]
    fn walk_continues_past_a_directory_it_cannot_list() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "locked/secret.go");
        let main_go = write(dir.path(), "main.go");
        let t0 = an_hour_ago();
        stamp_tree(dir.path(), t0);
        set_mtime(&main_go, t0 + Duration::from_secs(5));

        let locked = dir.path().join("locked");
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000)).unwrap();
        let listable = std::fs::read_dir(&locked).is_ok();

        let target = WatchTarget::new(dir.path(), IgnorePolicy::new(&[], true).unwrap()).unwrap();
        let report = scan_tree(&target, t0, &ManualClock::at(SystemTime::now()));
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(report.modified, 1);
        // Privileged users can list it anyway.
        if !listable {
            assert!(report.skipped > 0);
        }
    }

    #[tokio::test]
    async fn forward_coalesces_while_an_event_is_pending() {
        let (tx, mut rx) = mpsc::channel(1);
        let event = |modified| ChangeEvent {
            detected_at: SystemTime::UNIX_EPOCH,
            modified,
            skipped: 0,
        };
        forward(vec![event(1), event(2), event(3)].into_iter(), &tx);
        drop(tx);
        assert_eq!(rx.recv().await.map(|e| e.modified), Some(1));
        assert_eq!(rx.recv().await, None);
    }
}
