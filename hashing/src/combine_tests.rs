use super::{combine, hash_bytes, Digest, EMPTY_DIGEST};

#[test]
fn combine_is_order_sensitive() {
    let a = hash_bytes(b"alpha");
    let b = hash_bytes(b"beta");
    assert_ne!(combine([&a, &b]), combine([&b, &a]));
}

#[test]
fn combine_is_deterministic() {
    let a = hash_bytes(b"alpha");
    let b = hash_bytes(b"beta");
    assert_eq!(combine([&a, &b]), combine([&a, &b]));
}

#[test]
fn combine_of_empty_sequence_is_stable() {
    let empty: [&Digest; 0] = [];
    let first = combine(empty);
    let second = combine(empty);
    assert_eq!(first, second);
    assert_ne!(first, EMPTY_DIGEST);
}
