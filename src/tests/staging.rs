//! Pre-commit buffer behavior: visibility, exact-fit boundaries, resize.

use std::fs;

use pretty_assertions::assert_eq;
use tempfile::tempdir;

use super::helpers::{drain, enable_logging, new_log};
use crate::{Log, Position};

#[test]
fn staged_records_are_invisible_until_flush() {
    enable_logging();
    let tmp = tempdir().unwrap();
    let mut log = new_log(&tmp);
    log.set_pre_commit_buffer_size(4096);
    log.init().unwrap();
    log.add_subscriber("s", Position::Begin).unwrap();

    let mut writer = log.open_writer().unwrap();
    writer.write(b"one").unwrap();
    writer.write(b"two").unwrap();

    // Nothing is materialized in the segment yet.
    let mut reader = log.open_reader("s").unwrap();
    assert_eq!(reader.read_interval().unwrap().count, 0);

    writer.flush_pre_commit().unwrap();
    assert_eq!(
        drain(&mut reader),
        vec![b"one".to_vec(), b"two".to_vec()]
    );
}

#[test]
fn exact_fit_stages_and_the_next_record_flushes() {
    let tmp = tempdir().unwrap();
    let mut log = new_log(&tmp);
    // Exactly one record: 16-byte header + 8-byte payload.
    log.set_pre_commit_buffer_size(24);
    log.init().unwrap();
    log.add_subscriber("s", Position::Begin).unwrap();

    let dir = tmp.path().join("log");
    let mut writer = log.open_writer().unwrap();

    writer.write(b"aaaaaaaa").unwrap();
    assert_eq!(fs::metadata(dir.join("00000000")).unwrap().len(), 0);

    // The second record cannot join the full buffer: the staged bytes are
    // flushed first, then it takes their place.
    writer.write(b"bbbbbbbb").unwrap();
    assert_eq!(fs::metadata(dir.join("00000000")).unwrap().len(), 24);

    writer.flush_pre_commit().unwrap();
    assert_eq!(fs::metadata(dir.join("00000000")).unwrap().len(), 48);

    let mut reader = log.open_reader("s").unwrap();
    assert_eq!(
        drain(&mut reader),
        vec![b"aaaaaaaa".to_vec(), b"bbbbbbbb".to_vec()]
    );
}

#[test]
fn oversized_records_bypass_the_buffer() {
    let tmp = tempdir().unwrap();
    let mut log = new_log(&tmp);
    log.set_pre_commit_buffer_size(24);
    log.init().unwrap();
    log.add_subscriber("s", Position::Begin).unwrap();

    let big = vec![7u8; 100];
    let mut writer = log.open_writer().unwrap();
    writer.write(&big).unwrap();

    // Written straight through; visible without a flush.
    let mut reader = log.open_reader("s").unwrap();
    assert_eq!(drain(&mut reader), vec![big]);
}

#[test]
fn close_flushes_staged_records() {
    let tmp = tempdir().unwrap();
    let mut log = new_log(&tmp);
    log.set_pre_commit_buffer_size(1024);
    log.init().unwrap();
    log.add_subscriber("s", Position::Begin).unwrap();

    let mut writer = log.open_writer().unwrap();
    writer.write(b"parting").unwrap();
    writer.close().unwrap();

    let mut reader = log.open_reader("s").unwrap();
    assert_eq!(drain(&mut reader), vec![b"parting".to_vec()]);
}

#[test]
fn staged_bytes_survive_a_writer_crash() {
    let tmp = tempdir().unwrap();
    let mut log = new_log(&tmp);
    log.set_pre_commit_buffer_size(1024);
    log.init().unwrap();
    log.add_subscriber("s", Position::Begin).unwrap();

    let mut writer = log.open_writer().unwrap();
    writer.write(b"almost lost").unwrap();
    // Simulate a crash: the staged count is durable in the mapping, so
    // dropping without a flush stands in for a killed process...
    std::mem::forget(writer);

    // ...and the next writer inherits and flushes the staged record.
    let mut writer = log.open_writer().unwrap();
    writer.flush_pre_commit().unwrap();
    writer.close().unwrap();

    let mut reader = log.open_reader("s").unwrap();
    assert_eq!(drain(&mut reader), vec![b"almost lost".to_vec()]);
}

#[test]
fn resizing_the_buffer_preserves_staged_records() {
    let tmp = tempdir().unwrap();
    let mut log = new_log(&tmp);
    log.set_pre_commit_buffer_size(64);
    log.init().unwrap();
    log.add_subscriber("s", Position::Begin).unwrap();

    let mut writer = log.open_writer().unwrap();
    writer.write(b"staged").unwrap();
    std::mem::forget(writer);

    // Reopening with a different size flushes before recreating the file.
    let mut resized = Log::with_options(tmp.path().join("log"), *log.options());
    resized.set_pre_commit_buffer_size(256);
    let writer = resized.open_writer().unwrap();
    assert_eq!(
        fs::metadata(tmp.path().join("log/pre_commit")).unwrap().len(),
        256 + 4
    );
    writer.close().unwrap();

    let mut reader = log.open_reader("s").unwrap();
    assert_eq!(drain(&mut reader), vec![b"staged".to_vec()]);
}
