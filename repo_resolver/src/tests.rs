use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{routing::get, Router};
use tempfile::tempdir;

use cas::{ContentAddressableStore, LocalCas};
use hashing::Digest;

use crate::{RepoSpec, RepositoryResolver, Source};

const ARCHIVE_ROOT: &str = "some-repo-deadbeef";
const FILE_CONTENTS: &[u8] = b"fn widget() {}\n";

fn make_archive() -> bytes::Bytes {
    let enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(enc);
    let mut header = tar::Header::new_gnu();
    header.set_size(FILE_CONTENTS.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, format!("{ARCHIVE_ROOT}/src/widget.rs"), FILE_CONTENTS)
        .unwrap();
    let enc = builder.into_inner().unwrap();
    bytes::Bytes::from(enc.finish().unwrap())
}

async fn resolver(tmp: &std::path::Path) -> RepositoryResolver {
    let cas: Arc<dyn ContentAddressableStore> = Arc::new(LocalCas::new(tmp.join("cas")).unwrap());
    RepositoryResolver::new(
        tmp.join("roots"),
        tmp.join("mapping"),
        16 * 1024 * 1024,
        task_executor::Executor::new(),
        cas,
        reqwest::Client::new(),
    )
    .unwrap()
}

async fn serve_archive(archive: bytes::Bytes) -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();

    let router = Router::new().route(
        "/archive.tar.gz",
        get(move || {
            let archive = archive.clone();
            async move { archive.to_vec() }
        }),
    );

    tokio::spawn(async move {
        axum_server::from_tcp(listener)
            .serve(router.into_make_service())
            .await
            .unwrap();
    });

    addr
}

#[tokio::test]
async fn resolves_an_http_archive_with_matching_integrity() {
    let tmp = tempdir().unwrap();
    let resolver = resolver(tmp.path()).await;

    let archive = make_archive();
    let integrity = Digest::of_bytes(&archive);
    let addr = serve_archive(archive).await;

    let spec = RepoSpec {
        name: "widgets".to_string(),
        source: Source::Http {
            url: url::Url::parse(&format!("http://{addr}/archive.tar.gz")).unwrap(),
            integrity,
        },
        strip_prefix: Some(ARCHIVE_ROOT.to_string()),
    };

    let root = resolver.resolve(&spec).await.unwrap();
    let contents = std::fs::read(root.path.join("src/widget.rs")).unwrap();
    assert_eq!(contents, FILE_CONTENTS);

    let root_of = resolver.root_of("widgets").await.unwrap();
    assert_eq!(root_of, root.path);
}

#[tokio::test]
async fn an_http_archive_with_wrong_integrity_is_rejected() {
    let tmp = tempdir().unwrap();
    let resolver = resolver(tmp.path()).await;

    let archive = make_archive();
    // Same size as the real archive (so the streaming size cap doesn't trip
    // first) but a hash that can never match it.
    let wrong_integrity = Digest::new(hashing::Fingerprint::from_bytes_unsafe(&[0u8; 32]), archive.len());
    let addr = serve_archive(archive).await;

    let spec = RepoSpec {
        name: "widgets".to_string(),
        source: Source::Http {
            url: url::Url::parse(&format!("http://{addr}/archive.tar.gz")).unwrap(),
            integrity: wrong_integrity,
        },
        strip_prefix: None,
    };

    let err = resolver.resolve(&spec).await.unwrap_err();
    assert_eq!(err.kind(), errors::ErrorKind::IntegrityMismatch);
}

#[tokio::test]
async fn a_local_source_requires_no_fetch_and_is_content_fingerprinted() {
    let tmp = tempdir().unwrap();
    let resolver = resolver(tmp.path()).await;

    let dev_dir = tempdir().unwrap();
    std::fs::write(dev_dir.path().join("a.txt"), b"v1").unwrap();

    let spec = RepoSpec {
        name: "dev_repo".to_string(),
        source: Source::Local { path: dev_dir.path().to_path_buf() },
        strip_prefix: None,
    };

    let first = resolver.resolve(&spec).await.unwrap();
    assert_eq!(first.path, dev_dir.path());

    std::fs::write(dev_dir.path().join("a.txt"), b"v2").unwrap();
    let second = resolver.resolve(&spec).await.unwrap();
    assert_ne!(first.root_digest, second.root_digest);
}

#[tokio::test]
async fn root_of_fails_before_resolving() {
    let tmp = tempdir().unwrap();
    let resolver = resolver(tmp.path()).await;

    let err = resolver.root_of("never_resolved").await.unwrap_err();
    assert_eq!(err.kind(), errors::ErrorKind::TargetNotFound);
}

#[tokio::test]
async fn re_resolving_an_unchanged_declaration_reuses_the_materialized_root() {
    let tmp = tempdir().unwrap();
    let resolver = resolver(tmp.path()).await;

    let dev_dir = tempdir().unwrap();
    std::fs::write(dev_dir.path().join("a.txt"), b"stable").unwrap();

    let spec = RepoSpec {
        name: "dev_repo".to_string(),
        source: Source::Local { path: dev_dir.path().to_path_buf() },
        strip_prefix: None,
    };

    let first = resolver.resolve(&spec).await.unwrap();
    let second = resolver.resolve(&spec).await.unwrap();
    assert_eq!(first.root_digest, second.root_digest);
    assert_eq!(first.path, second.path);
}

#[tokio::test]
async fn rejects_an_empty_repository_name() {
    let tmp = tempdir().unwrap();
    let resolver = resolver(tmp.path()).await;

    let spec = RepoSpec {
        name: String::new(),
        source: Source::Local { path: PathBuf::from(".") },
        strip_prefix: None,
    };

    let err = resolver.resolve(&spec).await.unwrap_err();
    assert_eq!(err.kind(), errors::ErrorKind::ConfigInvalid);
}

#[tokio::test]
async fn a_nonexistent_local_path_is_rejected() {
    let tmp = tempdir().unwrap();
    let resolver = resolver(tmp.path()).await;

    let spec = RepoSpec {
        name: "missing".to_string(),
        source: Source::Local { path: tmp.path().join("does-not-exist") },
        strip_prefix: None,
    };

    let err = resolver.resolve(&spec).await.unwrap_err();
    assert_eq!(err.kind(), errors::ErrorKind::ConfigInvalid);
}

#[test]
fn max_attempts_constant_is_nonzero() {
    assert!(NonZeroUsize::new(crate::DEFAULT_MAX_ATTEMPTS).is_some());
}
