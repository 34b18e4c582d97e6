use super::*;
use hashing::EMPTY_DIGEST;

fn sample_action(id: &str) -> Action {
    Action {
        id: id.to_string(),
        argv: vec!["echo".to_string(), "hi".to_string()],
        env: BTreeMap::new(),
        inputs: BTreeMap::new(),
        output_paths: BTreeSet::new(),
        tool_digest: EMPTY_DIGEST,
        platform: "x86_64-unknown-linux-gnu".to_string(),
        priority: Priority::Normal,
        capabilities: CapabilitySet::default(),
    }
}

#[test]
fn identical_actions_fingerprint_identically() {
    let a1 = sample_action("//foo:bar");
    let mut a2 = sample_action("//foo:bar");
    a2.id = "//foo:bar".to_string(); // id itself is not part of the canonical encoding
    assert_eq!(fingerprint_action(&a1), fingerprint_action(&a2));
}

#[test]
fn differing_argv_changes_fingerprint() {
    let a1 = sample_action("//foo:bar");
    let mut a2 = sample_action("//foo:bar");
    a2.argv = vec!["echo".to_string(), "bye".to_string()];
    assert_ne!(fingerprint_action(&a1), fingerprint_action(&a2));
}

#[test]
fn env_insertion_order_does_not_matter() {
    let mut a1 = sample_action("//foo:bar");
    a1.env.insert("A".to_string(), "1".to_string());
    a1.env.insert("B".to_string(), "2".to_string());

    let mut a2 = sample_action("//foo:bar");
    a2.env.insert("B".to_string(), "2".to_string());
    a2.env.insert("A".to_string(), "1".to_string());

    assert_eq!(fingerprint_action(&a1), fingerprint_action(&a2));
}

#[test]
fn differing_capabilities_changes_fingerprint() {
    let a1 = sample_action("//foo:bar");
    let mut a2 = sample_action("//foo:bar");
    a2.capabilities.network = true;
    assert_ne!(fingerprint_action(&a1), fingerprint_action(&a2));
}

#[test]
fn the_id_field_itself_is_irrelevant_to_the_fingerprint() {
    let a1 = sample_action("//foo:bar");
    let a2 = sample_action("//foo:unrelated_but_identical_otherwise");
    assert_eq!(fingerprint_action(&a1), fingerprint_action(&a2));
}

#[test]
fn output_paths_with_a_parent_dir_component_are_rejected() {
    let mut a = sample_action("//foo:bar");
    a.output_paths.insert(PathBuf::from("../escape.txt"));
    let err = a.validate().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidOutputPath);
}

#[test]
fn absolute_output_paths_are_rejected() {
    let mut a = sample_action("//foo:bar");
    a.output_paths.insert(PathBuf::from("/etc/passwd"));
    assert!(a.validate().is_err());
}

#[test]
fn ordinary_relative_output_paths_validate() {
    let mut a = sample_action("//foo:bar");
    a.output_paths.insert(PathBuf::from("out/bin"));
    assert!(a.validate().is_ok());
}
