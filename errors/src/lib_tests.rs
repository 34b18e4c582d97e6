use super::*;

#[test]
fn context_trail_accumulates_in_order() {
    let err = BuildError::new(ErrorKind::CacheIoFailed, "lmdb put failed")
        .context("storing blob abc123")
        .context("recording action cache entry");
    assert_eq!(
        err.context_trail(),
        &["storing blob abc123", "recording action cache entry"]
    );
}

#[test]
fn display_includes_kind_context_and_suggestions() {
    let err = BuildError::new(ErrorKind::ActionTimeout, "exceeded 30s")
        .context("running //foo:bar")
        .suggest("increase the action timeout capability");
    let rendered = err.to_string();
    assert!(rendered.contains("ACTION_TIMEOUT"));
    assert!(rendered.contains("running //foo:bar"));
    assert!(rendered.contains("increase the action timeout"));
}

#[test]
fn recoverability_is_derived_from_kind() {
    let transient = BuildError::new(ErrorKind::NetworkUnavailable, "connect refused");
    assert!(transient.is_transient());

    let user = BuildError::new(ErrorKind::TargetNotFound, "no such target //a:b");
    assert_eq!(user.recoverability(), Recoverability::User);
}

#[test]
fn result_ext_maps_string_errors() {
    let res: Result<()> = Err("boom".to_string()).map_err_kind(ErrorKind::Internal);
    let err = res.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert_eq!(err.message(), "boom");
}
