use super::*;
use crate::Recoverability;

#[test]
fn transient_kinds_are_retriable() {
    assert_eq!(
        ErrorKind::ActionTimeout.recoverability(),
        Recoverability::Transient
    );
    assert_eq!(
        ErrorKind::WorkerUnreachable.recoverability(),
        Recoverability::Transient
    );
}

#[test]
fn user_kinds_are_not_retried() {
    assert_eq!(
        ErrorKind::CircularDependency.recoverability(),
        Recoverability::User
    );
}

#[test]
fn integrity_kinds_are_fatal() {
    assert_eq!(
        ErrorKind::IntegrityMismatch.recoverability(),
        Recoverability::Fatal
    );
    assert_eq!(ErrorKind::IntegrityMismatch.category(), ErrorCategory::Integrity);
}

#[test]
fn as_str_round_trips_category_grouping() {
    // Every kind in the same category should use the same recoverability,
    // since recoverability is derived from category alone.
    let build_kinds = [ErrorKind::BuildFailed, ErrorKind::OutputMissing];
    for k in build_kinds {
        assert_eq!(k.category(), ErrorCategory::Build);
        assert_eq!(k.recoverability(), Recoverability::Fatal);
    }
}
