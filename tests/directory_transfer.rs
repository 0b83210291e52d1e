mod common;

use std::path::Path;
use std::sync::Arc;

use common::{memory_session, memory_session_with, temp_files, Recorder};
use oxideterm_transfer::config::TransferConfig;
use oxideterm_transfer::sftp::{mode_bits, EntryKind, MemoryFaults, SftpError, TransferControl};

async fn write_local(path: &Path, contents: &[u8]) {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.unwrap();
    }
    tokio::fs::write(path, contents).await.unwrap();
}

/// `root/{a.txt (5 B), sub/b.txt (0 B), link -> a.txt}`
async fn sample_tree(base: &Path) -> std::path::PathBuf {
    let root = base.join("root");
    write_local(&root.join("a.txt"), b"hello").await;
    write_local(&root.join("sub").join("b.txt"), b"").await;
    #[cfg(unix)]
    std::os::unix::fs::symlink("a.txt", root.join("link")).unwrap();
    root
}

#[tokio::test]
async fn upload_tree_skips_symlinks() {
    let (channel, session) = memory_session();
    channel.add_dir("/dest");
    let dir = tempfile::tempdir().unwrap();
    let root = sample_tree(dir.path()).await;

    let mut progress = Recorder::default();
    let summary = session
        .upload_directory(&root, "/dest", &mut progress, None)
        .await
        .unwrap();

    assert_eq!(channel.file_contents("/dest/a.txt").unwrap(), b"hello");
    assert_eq!(channel.file_contents("/dest/sub/b.txt").unwrap(), b"");
    assert!(!channel.exists("/dest/link"));
    assert!(temp_files(&channel).is_empty());

    assert_eq!(summary.files, 2);
    assert_eq!(summary.directories, 2);
    assert_eq!(summary.bytes, 5);
    #[cfg(unix)]
    assert_eq!(summary.skipped, 1);

    assert_eq!(progress.total_bytes(), 5);
    let mut labels = progress.labels.clone();
    labels.sort();
    assert_eq!(labels, vec!["a.txt", "sub/b.txt"]);
    assert_eq!(progress.closes, 1);
    assert_eq!(progress.cancels, 0);
    assert_eq!(channel.open_handles(), 0);
}

#[tokio::test]
async fn upload_tree_twice_is_idempotent() {
    let (channel, session) = memory_session();
    channel.add_dir("/dest");
    let dir = tempfile::tempdir().unwrap();
    let root = sample_tree(dir.path()).await;

    session
        .upload_directory(&root, "/dest", &mut Recorder::default(), None)
        .await
        .unwrap();
    let first = channel.paths();
    let first_a = channel.file_contents("/dest/a.txt");

    session
        .upload_directory(&root, "/dest", &mut Recorder::default(), None)
        .await
        .unwrap();
    assert_eq!(channel.paths(), first);
    assert_eq!(channel.file_contents("/dest/a.txt"), first_a);
}

#[tokio::test]
async fn upload_of_plain_file_root() {
    let (channel, session) = memory_session();
    channel.add_dir("/dest");
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("single.txt");
    write_local(&file, b"only me").await;

    let mut progress = Recorder::default();
    let summary = session
        .upload_directory(&file, "/dest/single.txt", &mut progress, None)
        .await
        .unwrap();

    assert_eq!(summary.files, 1);
    assert_eq!(summary.directories, 0);
    assert_eq!(channel.file_contents("/dest/single.txt").unwrap(), b"only me");
    assert_eq!(progress.labels, vec!["single.txt"]);
}

#[tokio::test]
async fn upload_failure_aborts_job_and_cancels_once() {
    let (channel, session) = memory_session();
    channel.add_dir("/dest");
    channel.set_faults(MemoryFaults {
        fail_open_path: Some("/dest/sub/b.txt.tabby-upload".to_string()),
        ..Default::default()
    });
    let dir = tempfile::tempdir().unwrap();
    let root = sample_tree(dir.path()).await;

    let mut progress = Recorder::default();
    let err = session
        .upload_directory(&root, "/dest", &mut progress, None)
        .await
        .unwrap_err();

    assert!(matches!(err, SftpError::PermissionDenied(_)));
    assert_eq!(progress.cancels, 1);
    assert_eq!(progress.closes, 0);
    assert!(!channel.exists("/dest/sub/b.txt"));
    assert!(temp_files(&channel).is_empty());
}

#[tokio::test]
async fn download_tree_mirrors_regular_files_only() {
    let (channel, session) = memory_session();
    channel.add_file("/srv/root/a.txt", b"hello");
    channel.add_file("/srv/root/sub/b.txt", b"");
    channel.add_symlink("/srv/root/link", "a.txt");
    channel.add_special("/srv/root/sock", mode_bits::S_IFSOCK | 0o755);

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let mut progress = Recorder::default();
    let summary = session
        .download_directory("/srv/root", &out, &mut progress, None)
        .await
        .unwrap();

    assert_eq!(tokio::fs::read(out.join("a.txt")).await.unwrap(), b"hello");
    assert_eq!(
        tokio::fs::read(out.join("sub").join("b.txt")).await.unwrap(),
        b""
    );
    assert!(tokio::fs::symlink_metadata(out.join("link")).await.is_err());
    assert!(tokio::fs::symlink_metadata(out.join("sock")).await.is_err());

    assert_eq!(summary.files, 2);
    assert_eq!(summary.skipped, 2);
    assert_eq!(progress.total_bytes(), 5);
    assert_eq!(progress.labels, vec!["a.txt", "sub/b.txt"]);
    assert_eq!(progress.closes, 1);
    assert_eq!(channel.open_handles(), 0);
}

#[tokio::test]
async fn download_into_existing_directory() {
    let (channel, session) = memory_session();
    channel.add_file("/srv/root/a.txt", b"hello");

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    tokio::fs::create_dir(&out).await.unwrap();
    write_local(&out.join("a.txt"), b"stale, longer content").await;

    session
        .download_directory("/srv/root", &out, &mut Recorder::default(), None)
        .await
        .unwrap();
    assert_eq!(tokio::fs::read(out.join("a.txt")).await.unwrap(), b"hello");
}

#[tokio::test]
async fn download_of_symlink_root_transfers_nothing() {
    let (channel, session) = memory_session();
    channel.add_file("/srv/real/a.txt", b"hello");
    channel.add_symlink("/srv/alias", "/srv/real");

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let summary = session
        .download_directory("/srv/alias", &out, &mut Recorder::default(), None)
        .await
        .unwrap();

    assert_eq!(summary.files, 0);
    assert_eq!(summary.skipped, 1);
    assert!(tokio::fs::metadata(&out).await.is_err());
}

#[tokio::test]
async fn cancelled_job_stops_before_first_entry() {
    let (channel, session) = memory_session();
    channel.add_file("/srv/root/a.txt", b"hello");

    let control = Arc::new(TransferControl::new());
    control.cancel();
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let mut progress = Recorder::default();

    let err = session
        .download_directory("/srv/root", &out, &mut progress, Some(control))
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(progress.cancels, 1);
    assert!(tokio::fs::metadata(&out).await.is_err());
}

#[tokio::test]
async fn closed_connection_fails_directory_job() {
    let (channel, session) = memory_session();
    channel.add_file("/srv/root/a.txt", b"hello");
    channel.close_connection();
    session.closed().await;

    let dir = tempfile::tempdir().unwrap();
    let mut progress = Recorder::default();
    let err = session
        .download_directory("/srv/root", &dir.path().join("out"), &mut progress, None)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SftpError::ConnectionClosed | SftpError::TransferCancelled
    ));
    assert_eq!(progress.cancels, 1);
}

#[tokio::test]
async fn upload_into_linked_remote_directory() {
    let (channel, session) = memory_session();
    channel.add_dir("/real");
    channel.add_symlink("/dest", "/real");
    let dir = tempfile::tempdir().unwrap();
    let root = sample_tree(dir.path()).await;

    session
        .upload_directory(&root, "/dest", &mut Recorder::default(), None)
        .await
        .unwrap();

    assert_eq!(channel.file_contents("/real/a.txt").unwrap(), b"hello");
    assert_eq!(channel.file_contents("/real/sub/b.txt").unwrap(), b"");
    assert!(temp_files(&channel).is_empty());
    assert_eq!(session.lstat("/dest").await.unwrap().kind, EntryKind::Symlink);
}

#[cfg(unix)]
#[tokio::test]
async fn download_into_linked_local_directory() {
    let (channel, session) = memory_session();
    channel.add_file("/srv/root/a.txt", b"hello");

    let dir = tempfile::tempdir().unwrap();
    let real = dir.path().join("real");
    tokio::fs::create_dir(&real).await.unwrap();
    let out = dir.path().join("out");
    std::os::unix::fs::symlink(&real, &out).unwrap();

    session
        .download_directory("/srv/root", &out, &mut Recorder::default(), None)
        .await
        .unwrap();

    assert_eq!(tokio::fs::read(real.join("a.txt")).await.unwrap(), b"hello");
    let meta = tokio::fs::symlink_metadata(&out).await.unwrap();
    assert!(meta.file_type().is_symlink());
}

#[cfg(unix)]
async fn local_mode(path: &Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::metadata(path).await.unwrap().permissions().mode() & 0o777
}

/// Bits a freshly created local directory gets under the current umask
#[cfg(unix)]
async fn umask_allowed(base: &Path) -> u32 {
    let reference = base.join("reference");
    tokio::fs::create_dir(&reference).await.unwrap();
    local_mode(&reference).await
}

#[cfg(unix)]
#[tokio::test]
async fn download_applies_remote_directory_mode() {
    let (channel, session) = memory_session();
    channel.add_dir_with_mode("/srv/root/private", 0o750);
    channel.add_dir_with_mode("/srv/root/locked", 0o500);
    channel.add_file("/srv/root/locked/a.txt", b"hello");

    let dir = tempfile::tempdir().unwrap();
    let allowed = umask_allowed(dir.path()).await;
    let out = dir.path().join("out");
    session
        .download_directory("/srv/root", &out, &mut Recorder::default(), None)
        .await
        .unwrap();

    assert_eq!(local_mode(&out.join("private")).await, 0o750 & allowed);
    // Owner keeps rwx so the directory can be filled
    assert_eq!(local_mode(&out.join("locked")).await, 0o700 & allowed);
    assert_eq!(
        tokio::fs::read(out.join("locked").join("a.txt")).await.unwrap(),
        b"hello"
    );
}

#[cfg(unix)]
#[tokio::test]
async fn download_ignores_remote_directory_mode_when_disabled() {
    let (channel, session) = memory_session_with(TransferConfig {
        preserve_directory_mode: false,
        ..Default::default()
    });
    channel.add_dir_with_mode("/srv/root/private", 0o750);

    let dir = tempfile::tempdir().unwrap();
    let allowed = umask_allowed(dir.path()).await;
    let out = dir.path().join("out");
    session
        .download_directory("/srv/root", &out, &mut Recorder::default(), None)
        .await
        .unwrap();

    assert_eq!(local_mode(&out.join("private")).await, allowed);
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn upload_skips_non_utf8_local_names() {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    let (channel, session) = memory_session();
    channel.add_dir("/dest");
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("root");
    write_local(&root.join("a.txt"), b"hello").await;
    write_local(&root.join(OsStr::from_bytes(b"bad\xff")), b"x").await;

    let summary = session
        .upload_directory(&root, "/dest", &mut Recorder::default(), None)
        .await
        .unwrap();

    assert_eq!(summary.files, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(channel.paths(), vec!["/", "/dest", "/dest/a.txt"]);
}
