//! Entry streams, busy archives and copying.
//!
//! This file focuses on:
//! - Writer exclusivity and idempotent closing
//! - Streams disconnected by updates
//! - Busy archives and waiting for other threads
//! - Order of entries written back to an archive
//! - Copies between archives and native files

mod common;

use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use archfs::{Error, Severity, Timestamp, UpdateOptions, is_stream_closed};
use common::{RecordingDriver, Scratch, read_zip, recording_fs, write_zip};

#[test]
fn test_second_writer_of_entry_is_busy() {
    let s = Scratch::new();
    let path = s.path("a.zip/x.txt");

    let mut first = s.fs.open_write(&path).unwrap();
    first.write_all(b"first").unwrap();
    let err = s.fs.open_write(&path).unwrap_err();
    assert!(matches!(err, Error::EntryBusy { .. }), "{err}");
    assert!(err.is_recoverable());
    first.close().unwrap();

    let mut second = s.fs.open_write(&path).unwrap();
    second.write_all(b"second").unwrap();
    second.close().unwrap();
    assert_eq!(s.fs.read(&path).unwrap(), b"second");
}

#[test]
fn test_close_is_idempotent() {
    let s = Scratch::new();
    let path = s.path("a.zip/x.txt");

    let mut writer = s.fs.open_write(&path).unwrap();
    writer.write_all(b"data").unwrap();
    writer.close().unwrap();
    writer.close().unwrap();
    assert!(writer.write_all(b"more").is_err());

    let mut reader = s.fs.open_read(&path).unwrap();
    let mut data = Vec::new();
    reader.read_to_end(&mut data).unwrap();
    reader.close();
    reader.close();
    assert_eq!(data, b"data");
}

#[test]
fn test_umount_disconnects_own_streams() {
    let s = Scratch::new();
    let archive = s.path("a.zip");
    write_zip(&archive, &[("old.txt", b"old")]);

    let mut reader = s.fs.open_read(archive.join("old.txt")).unwrap();
    let mut writer = s.fs.open_write(archive.join("new.txt")).unwrap();
    writer.write_all(b"new").unwrap();

    let report = s.fs.umount().unwrap();
    assert!(!report.is_empty());
    assert!(report.is_warning_only());

    let mut buf = [0u8; 8];
    let err = reader.read(&mut buf).unwrap_err();
    assert!(is_stream_closed(&err), "{err}");
    let err = writer.write(b"late").unwrap_err();
    assert!(is_stream_closed(&err), "{err}");
    writer.close().unwrap();

    // the writer's data was committed when it was disconnected
    assert_eq!(
        read_zip(&archive),
        vec![
            ("new.txt".to_string(), b"new".to_vec()),
            ("old.txt".to_string(), b"old".to_vec()),
        ]
    );
}

#[test]
fn test_update_is_busy_while_other_thread_reads() {
    let s = Scratch::new();
    let archive = s.path("a.zip");
    write_zip(&archive, &[("old.txt", b"old")]);
    s.fs.write(archive.join("new.txt"), b"new").unwrap();

    let (opened_tx, opened_rx) = mpsc::channel();
    let (close_tx, close_rx) = mpsc::channel::<()>();
    let fs = s.fs.clone();
    let old = archive.join("old.txt");
    let holder = thread::spawn(move || {
        let mut reader = fs.open_read(&old).unwrap();
        opened_tx.send(()).unwrap();
        close_rx.recv().unwrap();
        let mut data = Vec::new();
        reader.read_to_end(&mut data).unwrap();
        reader.close();
        data
    });
    opened_rx.recv().unwrap();

    let err = s.fs.update(&archive).unwrap_err();
    match &err {
        Error::Update(report) => {
            assert_eq!(report.max_severity(), Some(Severity::Busy));
            assert!(report.is_recoverable());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.is_recoverable());

    close_tx.send(()).unwrap();
    assert_eq!(holder.join().unwrap(), b"old");
    s.fs.update(&archive).unwrap();
    assert_eq!(read_zip(&archive).len(), 2);
}

#[test]
fn test_busy_output_is_reported_before_input() {
    let s = Scratch::new();
    let archive = s.path("a.zip");
    write_zip(&archive, &[("old.txt", b"old")]);

    let (opened_tx, opened_rx) = mpsc::channel();
    let (close_tx, close_rx) = mpsc::channel::<()>();
    let fs = s.fs.clone();
    let holder_archive = archive.clone();
    let holder = thread::spawn(move || {
        let mut reader = fs.open_read(holder_archive.join("old.txt")).unwrap();
        let mut writer = fs.open_write(holder_archive.join("new.txt")).unwrap();
        opened_tx.send(()).unwrap();
        close_rx.recv().unwrap();
        let mut data = Vec::new();
        reader.read_to_end(&mut data).unwrap();
        writer.write_all(b"new").unwrap();
        writer.close().unwrap();
        data
    });
    opened_rx.recv().unwrap();

    for options in [UpdateOptions::sync(), UpdateOptions::sync().close_input_streams(true)] {
        let err = s.fs.update_with(&archive, &options).unwrap_err();
        let Error::Update(report) = &err else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(report.len(), 1, "{report}");
        let primary = report.primary().unwrap();
        assert_eq!(primary.severity(), Severity::Busy);
        assert!(primary.message().contains("output"), "{report}");
    }

    // the reader was left alone
    close_tx.send(()).unwrap();
    assert_eq!(holder.join().unwrap(), b"old");
    s.fs.umount().unwrap();
    assert_eq!(read_zip(&archive).len(), 2);
}

#[test]
fn test_failed_update_keeps_target() {
    let s = Scratch::new();
    let fs = recording_fs(&s, Arc::new(RecordingDriver::failing()));
    let archive = s.path("a.rec");
    write_zip(&archive, &[("old.txt", b"old")]);
    let before = std::fs::read(&archive).unwrap();

    fs.write(archive.join("new.txt"), b"new").unwrap();
    let err = fs.update(&archive).unwrap_err();
    let Error::Update(report) = &err else {
        panic!("unexpected error: {err}");
    };
    assert_eq!(report.max_severity(), Some(Severity::Fatal));
    let primary = report.primary().unwrap();
    assert_eq!(primary.severity(), Severity::Fatal);
    assert_eq!(primary.archive(), std::fs::canonicalize(&archive).unwrap());
    assert!(matches!(primary.cause(), Some(Error::Io(_))), "{report}");
    assert!(!err.is_recoverable());

    assert_eq!(s.temp_files(), 0);
    assert_eq!(std::fs::read(&archive).unwrap(), before);
    assert_eq!(fs.list(&archive), Some(vec!["old.txt".to_string()]));
}

#[test]
fn test_failed_update_of_new_archive_leaves_nothing() {
    let s = Scratch::new();
    let fs = recording_fs(&s, Arc::new(RecordingDriver::failing()));
    let archive = s.path("new.rec");

    fs.write(archive.join("x.txt"), b"x").unwrap();
    assert!(archive.exists());
    let err = fs.umount().unwrap_err();
    assert!(!err.is_recoverable(), "{err}");
    assert!(!archive.exists());
    assert_eq!(s.temp_files(), 0);
    assert!(!fs.exists(archive.join("x.txt")));
}

#[test]
fn test_update_waits_for_other_thread() {
    let s = Scratch::new();
    let path = s.path("a.zip/x.txt");
    s.fs.write(s.path("a.zip/y.txt"), b"y").unwrap();

    let (opened_tx, opened_rx) = mpsc::channel();
    let fs = s.fs.clone();
    let writer_path = path.clone();
    let holder = thread::spawn(move || {
        let mut writer = fs.open_write(&writer_path).unwrap();
        opened_tx.send(()).unwrap();
        thread::sleep(Duration::from_millis(50));
        writer.write_all(b"late but whole").unwrap();
        writer.close().unwrap();
    });
    opened_rx.recv().unwrap();

    let options = UpdateOptions::sync()
        .wait_output_streams(true)
        .timeout(Duration::from_secs(10));
    s.fs.update_with(s.path("a.zip"), &options).unwrap();
    holder.join().unwrap();
    s.fs.umount().unwrap();
    assert_eq!(s.fs.read(&path).unwrap(), b"late but whole");
}

#[test]
fn test_directories_are_written_after_their_children() {
    let s = Scratch::new();
    let driver = Arc::new(RecordingDriver::default());
    let fs = recording_fs(&s, Arc::clone(&driver));
    let archive = s.path("a.rec");
    write_zip(
        &archive,
        &[("a/", b""), ("a/b/", b""), ("a/b/c.txt", b"c")],
    );

    fs.write(archive.join("z.txt"), b"z").unwrap();
    fs.umount().unwrap();

    let written = driver.written();
    let position = |name: &str| {
        written
            .iter()
            .position(|n| n == name)
            .unwrap_or_else(|| panic!("{name} not written: {written:?}"))
    };
    assert!(position("z.txt") < position("a/b/c.txt"));
    assert!(position("a/b/c.txt") < position("a/b/"));
    assert!(position("a/b/") < position("a/"));
    assert_eq!(written.len(), 4);
}

#[test]
fn test_ghost_directories_are_not_written() {
    let s = Scratch::new();
    let driver = Arc::new(RecordingDriver::default());
    let fs = recording_fs(&s, Arc::clone(&driver));
    let archive = s.path("a.rec");
    write_zip(&archive, &[("ghost/file.txt", b"f")]);

    assert!(fs.is_directory(archive.join("ghost")));
    assert_eq!(fs.last_modified(archive.join("ghost")), None);
    fs.write(archive.join("other.txt"), b"o").unwrap();
    fs.umount().unwrap();

    let mut written = driver.written();
    written.sort();
    assert_eq!(written, ["ghost/file.txt", "other.txt"]);
}

#[test]
fn test_copy_between_archives() {
    let s = Scratch::new();
    let src = s.path("src.zip");
    let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 7) as u8).collect();
    write_zip(&src, &[("data.bin", payload.as_slice())]);

    let copied = s.fs.copy(src.join("data.bin"), s.path("dst.zip/sub/data.bin")).unwrap();
    assert_eq!(copied, payload.len() as u64);
    assert_eq!(s.fs.len(s.path("dst.zip/sub/data.bin")), payload.len() as u64);
    s.fs.umount().unwrap();

    assert_eq!(s.fs.read(s.path("dst.zip/sub/data.bin")).unwrap(), payload);
    assert_eq!(s.fs.read(src.join("data.bin")).unwrap(), payload);
}

#[test]
fn test_copy_within_archive_and_back_out() {
    let s = Scratch::new();
    let archive = s.path("a.zip");
    s.fs.write(archive.join("x.txt"), b"content").unwrap();

    s.fs.copy(archive.join("x.txt"), archive.join("y.txt")).unwrap();
    s.fs.copy(archive.join("y.txt"), s.path("native.txt")).unwrap();
    assert_eq!(std::fs::read(s.path("native.txt")).unwrap(), b"content");

    std::fs::write(s.path("in.txt"), b"from disk").unwrap();
    s.fs.copy(s.path("in.txt"), archive.join("dir/in.txt")).unwrap();
    s.fs.umount().unwrap();

    let names: Vec<_> = read_zip(&archive).into_iter().map(|(n, _)| n).collect();
    assert_eq!(names, ["dir/", "dir/in.txt", "x.txt", "y.txt"]);
    assert_eq!(s.fs.read(archive.join("dir/in.txt")).unwrap(), b"from disk");
}

#[test]
fn test_copy_preserving_keeps_time() {
    let s = Scratch::new();
    let src = s.path("a.zip/x.txt");
    let time = Timestamp::from_unix_secs(1_500_000_000);
    s.fs.write(&src, b"x").unwrap();
    s.fs.set_last_modified(&src, time).unwrap();

    s.fs.copy_preserving(&src, s.path("b.zip/x.txt")).unwrap();
    s.fs.copy(&src, s.path("b.zip/fresh.txt")).unwrap();
    s.fs.copy_preserving(&src, s.path("native.txt")).unwrap();
    s.fs.umount().unwrap();

    assert_eq!(s.fs.last_modified(s.path("b.zip/x.txt")), Some(time));
    assert_ne!(s.fs.last_modified(s.path("b.zip/fresh.txt")), Some(time));
    assert_eq!(s.fs.last_modified(s.path("native.txt")), Some(time));
}

#[test]
fn test_copy_onto_itself_fails() {
    let s = Scratch::new();
    let path = s.path("a.zip/x.txt");
    s.fs.write(&path, b"x").unwrap();
    assert!(s.fs.copy(&path, &path).is_err());
    assert_eq!(s.fs.read(&path).unwrap(), b"x");
}

#[test]
fn test_delete_after_write_is_reported() {
    let s = Scratch::new();
    let archive = s.path("a.zip");
    s.fs.write(archive.join("x.txt"), b"x").unwrap();
    s.fs.write(archive.join("keep.txt"), b"k").unwrap();
    s.fs.delete(archive.join("x.txt")).unwrap();
    assert!(!s.fs.exists(archive.join("x.txt")));

    let report = s.fs.update(&archive).unwrap();
    assert!(report.is_warning_only());
    assert!(
        report
            .diagnostics()
            .iter()
            .any(|d| d.message().contains("couldn't remove archive entry x.txt")),
        "{report}"
    );
    let names: Vec<_> = read_zip(&archive).into_iter().map(|(n, _)| n).collect();
    assert_eq!(names, ["keep.txt", "x.txt"]);
}

#[test]
fn test_read_after_write_before_update() {
    let s = Scratch::new();
    let archive = s.path("a.zip");
    write_zip(&archive, &[("x.txt", b"old")]);

    s.fs.write(archive.join("x.txt"), b"replaced").unwrap();
    assert_eq!(s.fs.read(archive.join("x.txt")).unwrap(), b"replaced");
    s.fs.write(archive.join("x.txt"), b"again").unwrap();
    assert_eq!(s.fs.len(archive.join("x.txt")), 5);
    s.fs.umount().unwrap();

    assert_eq!(read_zip(&archive), vec![("x.txt".to_string(), b"again".to_vec())]);
}
