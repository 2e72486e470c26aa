//! End-to-end tests against the public `AsyncFile` surface.
//!
//! The deterministic tests force the thread-pool backend so they run on
//! every platform; a parallel set runs against the native backend when the
//! `io-uring` feature is enabled and the kernel cooperates.

use asyncfile::{AsyncFile, BackendKind, Config, Error, Kind, OpenMode};
use std::path::PathBuf;
use tempfile::TempDir;

fn pool_file() -> AsyncFile {
    AsyncFile::with_config(Config {
        backend: Some(BackendKind::ThreadPool),
    })
    .expect("thread-pool backend is always available")
}

fn scratch(name: &str) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join(name);
    (dir, path)
}

#[test]
fn test_write_then_read_round_trip() {
    let (_dir, path) = scratch("roundtrip.bin");
    let file = pool_file();
    assert_eq!(file.open(&path, OpenMode::read_write()).wait(), None);

    let write = file.write(0, &b"asynchronous file"[..]);
    assert_eq!(write.kind(), Kind::Write);
    assert_eq!(write.wait(), None);
    assert_eq!(write.bytes_processed(), 17);
    assert_eq!(write.offset(), 0);

    let read = file.read(13, 4);
    assert_eq!(read.wait(), None);
    assert_eq!(read.data(), b"file");
    assert_eq!(read.bytes_processed(), 4);
}

#[test]
fn test_short_read_near_end_of_file_is_success() {
    let (_dir, path) = scratch("short.bin");
    std::fs::write(&path, b"0123456789").expect("seed file");

    let file = pool_file();
    assert_eq!(file.open(&path, OpenMode::read_only()).wait(), None);

    let read = file.read(6, 64);
    assert_eq!(read.wait(), None);
    assert_eq!(read.bytes_processed(), 4);
    assert_eq!(read.data(), b"6789");
}

#[test]
fn test_vectored_read_fills_buffers_front_to_back() {
    let (_dir, path) = scratch("vec.bin");
    std::fs::write(&path, b"abcdefgh").expect("seed file");

    let file = pool_file();
    assert_eq!(file.open(&path, OpenMode::read_only()).wait(), None);

    let read = file
        .read_vectored(2, vec![vec![0; 3], vec![0; 3], vec![0; 3]])
        .expect("thread pool supports vectored reads");
    assert_eq!(read.wait(), None);
    assert_eq!(read.bytes_processed(), 6);
    let bufs = read.buffers();
    assert_eq!(bufs[0], b"cde");
    assert_eq!(bufs[1], b"fgh");
    assert!(bufs[2].is_empty());
}

#[test]
fn test_vectored_write_concatenates_buffers() {
    let (_dir, path) = scratch("vecw.bin");
    let file = pool_file();
    assert_eq!(file.open(&path, OpenMode::read_write()).wait(), None);

    let write = file
        .write_vectored(0, vec![b"head".to_vec(), b"-tail".to_vec()])
        .expect("thread pool supports vectored writes");
    assert_eq!(write.wait(), None);
    assert_eq!(write.bytes_processed(), 9);
    file.close();

    assert_eq!(std::fs::read(&path).expect("written file"), b"head-tail");
}

#[test]
fn test_negative_offset_is_rejected() {
    let (_dir, path) = scratch("neg.bin");
    let file = pool_file();
    assert_eq!(file.open(&path, OpenMode::read_write()).wait(), None);

    let read = file.read(-8, 16);
    assert_eq!(read.wait(), Some(Error::IncorrectOffset));
    let write = file.write(-1, &b"x"[..]);
    assert_eq!(write.wait(), Some(Error::IncorrectOffset));
}

#[test]
fn test_negative_read_size_is_clamped_to_zero() {
    let (_dir, path) = scratch("clamp.bin");
    std::fs::write(&path, b"content").expect("seed file");

    let file = pool_file();
    assert_eq!(file.open(&path, OpenMode::read_only()).wait(), None);

    let read = file.read(0, -32);
    assert_eq!(read.wait(), None);
    assert_eq!(read.bytes_processed(), 0);
    assert!(read.data().is_empty());
}

#[test]
fn test_operations_without_open_file_report_file_not_open() {
    let file = pool_file();
    assert_eq!(file.read(0, 8).wait(), Some(Error::FileNotOpen));
    assert_eq!(file.write(0, &b"x"[..]).wait(), Some(Error::FileNotOpen));
    assert_eq!(file.flush().wait(), Some(Error::FileNotOpen));
}

#[test]
fn test_open_missing_file_fails() {
    let (_dir, path) = scratch("missing.bin");
    let file = pool_file();
    let open = file.open(&path, OpenMode::read_only());
    assert_eq!(open.kind(), Kind::Open);
    assert_eq!(open.wait(), Some(Error::Open));
    assert_eq!(file.size(), -1);
}

#[test]
fn test_open_without_access_mode_fails() {
    let (_dir, path) = scratch("noaccess.bin");
    std::fs::write(&path, b"x").expect("seed file");
    let file = pool_file();
    // Neither read nor write requested; the open is rejected the same way
    // on every backend.
    assert_eq!(
        file.open(&path, OpenMode::default()).wait(),
        Some(Error::Open)
    );
    assert_eq!(file.size(), -1);
}

#[test]
fn test_second_open_fails_while_file_is_open() {
    let (_dir, path) = scratch("twice.bin");
    let file = pool_file();
    assert_eq!(file.open(&path, OpenMode::read_write()).wait(), None);
    assert_eq!(
        file.open(&path, OpenMode::read_write()).wait(),
        Some(Error::Open)
    );
    // The original open is unaffected.
    assert_eq!(file.write(0, &b"still writable"[..]).wait(), None);
}

#[test]
fn test_reopen_after_close_succeeds() {
    let (_dir, path) = scratch("reopen.bin");
    let file = pool_file();
    assert_eq!(file.open(&path, OpenMode::read_write()).wait(), None);
    file.close();
    assert_eq!(file.open(&path, OpenMode::read_write()).wait(), None);
}

#[test]
fn test_write_to_read_only_file_fails() {
    let (_dir, path) = scratch("ro.bin");
    std::fs::write(&path, b"frozen").expect("seed file");

    let file = pool_file();
    assert_eq!(file.open(&path, OpenMode::read_only()).wait(), None);
    assert_eq!(file.write(0, &b"nope"[..]).wait(), Some(Error::Write));
}

#[test]
fn test_size_tracks_the_open_file() {
    let (_dir, path) = scratch("size.bin");
    let file = pool_file();
    assert_eq!(file.size(), -1);
    assert_eq!(file.open(&path, OpenMode::read_write()).wait(), None);
    assert_eq!(file.size(), 0);
    file.write(0, vec![9u8; 100]).wait();
    assert_eq!(file.size(), 100);
    file.close();
    assert_eq!(file.size(), -1);
}

#[test]
fn test_flush_after_write_succeeds() {
    let (_dir, path) = scratch("flush.bin");
    let file = pool_file();
    assert_eq!(file.open(&path, OpenMode::read_write()).wait(), None);
    file.write(0, &b"durable"[..]).wait();
    let flush = file.flush();
    assert_eq!(flush.kind(), Kind::Flush);
    assert_eq!(flush.wait(), None);
}

#[test]
fn test_close_finishes_every_operation_in_flight() {
    let (_dir, path) = scratch("close.bin");
    std::fs::write(&path, vec![1u8; 1 << 16]).expect("seed file");

    let file = pool_file();
    assert_eq!(file.open(&path, OpenMode::read_only()).wait(), None);
    let reads: Vec<_> = (0..16).map(|i| file.read(i * 4096, 4096)).collect();
    file.close();
    for read in &reads {
        assert!(read.is_finished());
        // Either the read slipped through before the close or it was
        // aborted; nothing else is acceptable.
        assert!(matches!(read.error(), None | Some(Error::Aborted)));
    }
}

#[test]
fn test_dropping_a_running_handle_does_not_hang() {
    let (_dir, path) = scratch("drop.bin");
    std::fs::write(&path, vec![2u8; 1 << 16]).expect("seed file");

    let file = pool_file();
    assert_eq!(file.open(&path, OpenMode::read_only()).wait(), None);
    for i in 0..8 {
        // Dropped immediately while possibly still queued or running; the
        // drop must cancel and wait, never leak a running operation.
        let _ = file.read(i * 1024, 1024);
    }
    // The file is still usable afterwards.
    let read = file.read(0, 4);
    assert_eq!(read.wait(), None);
    assert_eq!(read.data(), vec![2u8; 4]);
}

#[test]
fn test_dropping_the_file_finishes_outstanding_operations() {
    let (_dir, path) = scratch("dropfile.bin");
    std::fs::write(&path, vec![3u8; 1 << 16]).expect("seed file");

    let reads = {
        let file = pool_file();
        assert_eq!(file.open(&path, OpenMode::read_only()).wait(), None);
        let reads: Vec<_> = (0..8).map(|i| file.read(i * 4096, 4096)).collect();
        drop(file);
        reads
    };
    for read in &reads {
        assert!(read.is_finished());
        assert!(matches!(read.error(), None | Some(Error::Aborted)));
    }
}

#[test]
fn test_read_into_hands_back_the_callers_buffer_truncated() {
    let (_dir, path) = scratch("into.bin");
    std::fs::write(&path, b"xyz").expect("seed file");

    let file = pool_file();
    assert_eq!(file.open(&path, OpenMode::read_only()).wait(), None);
    let read = file.read_into(1, vec![0; 16]);
    assert_eq!(read.wait(), None);
    assert_eq!(read.data(), b"yz");
}

#[test]
fn test_operations_queue_in_submission_order() {
    let (_dir, path) = scratch("order.bin");
    let file = pool_file();
    assert_eq!(file.open(&path, OpenMode::read_write()).wait(), None);

    // Three overlapping writes; the last submission must win.
    let first = file.write(0, &b"aaaa"[..]);
    let second = file.write(0, &b"bbbb"[..]);
    let third = file.write(0, &b"cccc"[..]);
    assert_eq!(first.wait(), None);
    assert_eq!(second.wait(), None);
    assert_eq!(third.wait(), None);

    let read = file.read(0, 4);
    assert_eq!(read.wait(), None);
    assert_eq!(read.data(), b"cccc");
}

#[cfg(feature = "io-uring")]
mod native {
    use super::*;

    fn native_file() -> Option<AsyncFile> {
        // None on kernels without io_uring; the test silently passes.
        AsyncFile::with_config(Config {
            backend: Some(BackendKind::Native),
        })
    }

    #[test]
    fn test_native_round_trip() {
        let Some(file) = native_file() else {
            return;
        };
        let (_dir, path) = scratch("native.bin");
        assert_eq!(file.open(&path, OpenMode::read_write()).wait(), None);
        assert_eq!(file.write(0, &b"ring data"[..]).wait(), None);
        let read = file.read(5, 4);
        assert_eq!(read.wait(), None);
        assert_eq!(read.data(), b"data");
        assert_eq!(file.size(), 9);
    }

    #[test]
    fn test_native_matches_fallback_semantics_on_errors() {
        let Some(file) = native_file() else {
            return;
        };
        assert_eq!(file.read(0, 8).wait(), Some(Error::FileNotOpen));
        let (_dir, path) = scratch("nativeerr.bin");
        assert_eq!(file.open(&path, OpenMode::read_write()).wait(), None);
        assert_eq!(file.read(-4, 8).wait(), Some(Error::IncorrectOffset));
    }

    #[test]
    fn test_native_close_finishes_in_flight_operations() {
        let Some(file) = native_file() else {
            return;
        };
        let (_dir, path) = scratch("nativeclose.bin");
        std::fs::write(&path, vec![7u8; 1 << 16]).expect("seed file");
        assert_eq!(file.open(&path, OpenMode::read_only()).wait(), None);
        let reads: Vec<_> = (0..16).map(|i| file.read(i * 4096, 4096)).collect();
        file.close();
        for read in &reads {
            assert!(read.is_finished());
            assert!(matches!(read.error(), None | Some(Error::Aborted)));
        }
    }
}
