use devcanvas_lib::watcher::{FileEvent, FileEventKind, FileWatcher};
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn collect_until<F>(rx: &mpsc::Receiver<FileEvent>, mut done: F) -> Vec<FileEvent>
where
    F: FnMut(&[FileEvent]) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut seen = Vec::new();
    while Instant::now() < deadline {
        if let Ok(event) = rx.recv_timeout(Duration::from_millis(100)) {
            seen.push(event);
            if done(&seen) {
                break;
            }
        }
    }
    seen
}

fn has(events: &[FileEvent], kind: FileEventKind, path: &str) -> bool {
    events
        .iter()
        .any(|e| e.kind == kind && e.paths.iter().any(|p| p == path))
}

#[cfg_attr(not(target_os = "linux"), ignore = "event shapes differ per platform backend")]
#[test]
fn reports_relative_events_and_honours_excludes() {
    let temp = TempDir::new().expect("tempdir");
    std::fs::create_dir_all(temp.path().join("files/node_modules")).expect("seed dirs");

    let (tx, rx) = mpsc::channel();
    let mut watcher = FileWatcher::new(temp.path());
    watcher.on_event(move |event| {
        let _ = tx.send(event);
    });
    watcher
        .start("files", true, &["node_modules".to_string()])
        .expect("start watcher");
    assert!(watcher.is_watching());

    std::fs::write(temp.path().join("files/node_modules/pkg.js"), "x").expect("excluded write");
    std::fs::write(temp.path().join("files/page.tsx"), "a").expect("write");
    let events = collect_until(&rx, |seen| has(seen, FileEventKind::Add, "files/page.tsx"));
    assert!(has(&events, FileEventKind::Add, "files/page.tsx"), "{events:?}");

    std::fs::remove_file(temp.path().join("files/page.tsx")).expect("remove");
    let events = collect_until(&rx, |seen| has(seen, FileEventKind::Remove, "files/page.tsx"));
    assert!(has(&events, FileEventKind::Remove, "files/page.tsx"), "{events:?}");

    let all: Vec<FileEvent> = events.into_iter().chain(rx.try_iter()).collect();
    assert!(
        all.iter()
            .all(|e| e.paths.iter().all(|p| !p.contains("node_modules"))),
        "{all:?}"
    );

    watcher.stop();
    assert!(!watcher.is_watching());
}

#[test]
fn refuses_paths_outside_the_project() {
    let temp = TempDir::new().expect("tempdir");
    let mut watcher = FileWatcher::new(temp.path());
    assert!(watcher.start("../elsewhere", true, &[]).is_err());
    assert!(!watcher.is_watching());
}
