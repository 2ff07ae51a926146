use facemesh_core::{is_positive_match, FeatureVector};
use facemesh_store::{
    codec, EnrollMode, NewTemplate, Profile, StoreError, StoreOptions, TemplateStore,
};
use std::fs;
use tempfile::tempdir;

fn fv(values: &[f32]) -> FeatureVector {
    FeatureVector::new(values.to_vec()).unwrap()
}

fn open(dir: &std::path::Path) -> TemplateStore {
    TemplateStore::open(dir, StoreOptions::new(3)).unwrap()
}

#[test]
fn single_template_exact_match() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());
    store.enroll("a", "Alice", true, EnrollMode::Create).unwrap();
    store
        .add_template("a", fv(&[1.0, 0.0, 0.0]), 0.9, "upload")
        .unwrap();

    let out = store.match_probe(&fv(&[1.0, 0.0, 0.0]), 5, 0.5).unwrap();
    assert_eq!(out.len(), 1);
    let c = &out[0];
    assert_eq!(c.identity_id, "a");
    assert!((c.max_similarity - 1.0).abs() < 1e-6);
    assert!((c.avg_similarity - 1.0).abs() < 1e-6);
    assert!((c.confidence - 1.0).abs() < 1e-6);
    assert_eq!(c.template_count, 1);
    assert!(is_positive_match(c.confidence, 0.75));
}

#[test]
fn two_templates_weighted_confidence() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());
    store.enroll("a", "Alice", true, EnrollMode::Create).unwrap();
    store.add_template("a", fv(&[1.0, 0.0, 0.0]), 0.9, "one").unwrap();
    store.add_template("a", fv(&[0.0, 1.0, 0.0]), 0.9, "two").unwrap();

    let out = store.match_probe(&fv(&[0.9, 0.1, 0.0]), 5, -1.0).unwrap();
    let c = &out[0];
    let norm = (0.9f32 * 0.9 + 0.1 * 0.1).sqrt();
    assert!((c.max_similarity - 0.9 / norm).abs() < 1e-5);
    assert!((c.avg_similarity - (0.9 / norm + 0.1 / norm) / 2.0).abs() < 1e-5);
    assert!(c.max_similarity > c.avg_similarity);
    assert!((c.confidence - (0.7 * c.max_similarity + 0.3 * c.avg_similarity)).abs() < 1e-6);
}

#[test]
fn removed_identity_disappears() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());
    store.enroll("a", "Alice", true, EnrollMode::Create).unwrap();
    store.add_template("a", fv(&[1.0, 0.0, 0.0]), 0.9, "x").unwrap();
    store.remove_identity("a").unwrap();

    for probe in [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.3, 0.3, 0.3]] {
        let out = store.match_probe(&fv(&probe), 5, -1.0).unwrap();
        assert!(out.iter().all(|c| c.identity_id != "a"));
    }
    assert!(matches!(
        store.add_template("a", fv(&[1.0, 0.0, 0.0]), 0.9, "x"),
        Err(StoreError::NotFound(_))
    ));
    assert!(matches!(
        store.remove_identity("a"),
        Err(StoreError::NotFound(_))
    ));
}

#[test]
fn empty_store_matches_nothing() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());
    for top_k in [0, 1, 10] {
        assert!(store
            .match_probe(&fv(&[1.0, 2.0, 3.0]), top_k, -1.0)
            .unwrap()
            .is_empty());
    }
}

#[test]
fn store_survives_reopen() {
    let dir = tempdir().unwrap();
    let before = {
        let store = open(dir.path());
        store.enroll("b", "Bob", true, EnrollMode::Create).unwrap();
        store.enroll("a", "Alice", true, EnrollMode::Create).unwrap();
        store
            .add_templates(
                "a",
                vec![
                    NewTemplate::new(fv(&[0.1, 0.2, 0.3]), 0.8, "cam-0"),
                    NewTemplate::new(fv(&[0.3, 0.2, 0.1]), 0.6, "cam-1"),
                ],
            )
            .unwrap();
        store
            .set_profile(
                "a",
                Profile {
                    notes: "badge 42".into(),
                    ..Profile::default()
                },
            )
            .unwrap();
        let snapshot = store.snapshot();
        store.close().unwrap();
        snapshot
    };

    let reopened = open(dir.path());
    let after = reopened.snapshot();
    assert_eq!(after.identities, before.identities);
    assert_eq!(after.profiles, before.profiles);
    assert_eq!(after.created_at, before.created_at);

    let ids: Vec<String> = reopened.list_identities().into_iter().map(|i| i.id).collect();
    assert_eq!(ids, vec!["a", "b"]);
    let infos = reopened.templates("a").unwrap();
    assert_eq!(infos[0].provenance, "cam-0");
    assert_eq!(infos[1].provenance, "cam-1");
}

#[test]
fn only_one_committed_pair_on_disk() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());
    store.enroll("a", "Alice", true, EnrollMode::Create).unwrap();
    store.add_template("a", fv(&[1.0, 0.0, 0.0]), 0.9, "x").unwrap();
    store.add_template("a", fv(&[0.0, 1.0, 0.0]), 0.9, "y").unwrap();

    let names: Vec<String> = fs::read_dir(dir.path())
        .unwrap()
        .flatten()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    let blobs = names.iter().filter(|n| codec::is_blob_file_name(n)).count();
    assert_eq!(blobs, 1, "{names:?}");
    assert!(names.iter().any(|n| n == codec::METADATA_FILE));
    assert!(names.iter().all(|n| !n.contains(".tmp-")));
}

#[test]
fn missing_template_artifact_is_corrupt() {
    let dir = tempdir().unwrap();
    {
        let store = open(dir.path());
        store.enroll("a", "Alice", true, EnrollMode::Create).unwrap();
    }
    for entry in fs::read_dir(dir.path()).unwrap().flatten() {
        if codec::is_blob_file_name(&entry.file_name().to_string_lossy()) {
            fs::remove_file(entry.path()).unwrap();
        }
    }
    let err = TemplateStore::open(dir.path(), StoreOptions::new(3)).unwrap_err();
    assert!(matches!(err, StoreError::CorruptStore(_)), "{err}");
}

#[test]
fn tampered_metadata_is_corrupt() {
    let dir = tempdir().unwrap();
    {
        let store = open(dir.path());
        store.enroll("a", "Alice", true, EnrollMode::Create).unwrap();
        store.add_template("a", fv(&[1.0, 0.0, 0.0]), 0.9, "x").unwrap();
    }
    let path = dir.path().join(codec::METADATA_FILE);
    let mut doc: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
    doc["identities"][0]["templates"]
        .as_array_mut()
        .unwrap()
        .push(serde_json::json!({
            "provenance": "forged",
            "quality_score": 1.0,
            "created_at": "2026-01-01T00:00:00Z"
        }));
    fs::write(&path, serde_json::to_vec_pretty(&doc).unwrap()).unwrap();

    let err = TemplateStore::open(dir.path(), StoreOptions::new(3)).unwrap_err();
    assert!(matches!(err, StoreError::CorruptStore(_)), "{err}");
}

#[test]
fn dimension_change_is_rejected_on_open() {
    let dir = tempdir().unwrap();
    {
        let store = open(dir.path());
        store.enroll("a", "Alice", true, EnrollMode::Create).unwrap();
    }
    let err = TemplateStore::open(dir.path(), StoreOptions::new(4)).unwrap_err();
    assert!(matches!(err, StoreError::CorruptStore(_)));
}

#[test]
fn uncommitted_leftovers_do_not_affect_load() {
    let dir = tempdir().unwrap();
    let generation = {
        let store = open(dir.path());
        store.enroll("a", "Alice", true, EnrollMode::Create).unwrap();
        store.add_template("a", fv(&[1.0, 0.0, 0.0]), 0.9, "x").unwrap();
        store.snapshot().generation
    };
    // A crash after installing the next blob but before the metadata rename.
    let next = codec::blob_file_name(generation + 1);
    fs::write(dir.path().join(&next), b"half written").unwrap();
    fs::write(dir.path().join(".metadata.json.tmp-deadbeef"), b"{ \"trunc").unwrap();

    let store = open(dir.path());
    assert_eq!(store.identity("a").unwrap().template_count, 1);

    store.add_template("a", fv(&[0.0, 1.0, 0.0]), 0.9, "y").unwrap();
    drop(store);
    let reopened = open(dir.path());
    assert_eq!(reopened.identity("a").unwrap().template_count, 2);
    assert!(file_names(dir.path()).iter().all(|n| !n.contains(".tmp-")));
}

#[test]
fn io_failure_reports_and_keeps_memory() {
    let dir = tempdir().unwrap();
    let store_dir = dir.path().join("store");
    let store = open(&store_dir);
    store.enroll("a", "Alice", true, EnrollMode::Create).unwrap();
    let before = store.snapshot();

    // Replace the store directory with a plain file so every write fails.
    fs::remove_dir_all(&store_dir).unwrap();
    fs::write(&store_dir, b"not a directory").unwrap();

    let err = store
        .add_template("a", fv(&[1.0, 0.0, 0.0]), 0.9, "x")
        .unwrap_err();
    assert!(matches!(err, StoreError::Io { .. }), "{err}");
    assert_eq!(store.snapshot(), before);
}

#[test]
fn interrupted_commit_keeps_previous_pair() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());
    store.enroll("a", "Alice", true, EnrollMode::Create).unwrap();
    store.add_template("a", fv(&[1.0, 0.0, 0.0]), 0.9, "x").unwrap();
    let before = store.snapshot();
    let names_before = file_names(dir.path());

    // The new blob installs fine, but the metadata rename cannot replace a
    // non-empty directory.
    let metadata_path = dir.path().join(codec::METADATA_FILE);
    let committed = fs::read(&metadata_path).unwrap();
    fs::remove_file(&metadata_path).unwrap();
    fs::create_dir(&metadata_path).unwrap();
    fs::write(metadata_path.join("occupied"), b"x").unwrap();

    let err = store
        .add_template("a", fv(&[0.0, 1.0, 0.0]), 0.9, "y")
        .unwrap_err();
    assert!(matches!(err, StoreError::Io { .. }), "{err}");
    assert_eq!(store.snapshot(), before);
    assert_eq!(file_names(dir.path()), names_before);

    fs::remove_dir_all(&metadata_path).unwrap();
    fs::write(&metadata_path, committed).unwrap();
    drop(store);

    let reopened = open(dir.path());
    let after = reopened.snapshot();
    assert_eq!(after.identities, before.identities);
    assert_eq!(after.generation, before.generation);
    assert_eq!(reopened.identity("a").unwrap().template_count, 1);
}

#[test]
fn lost_metadata_is_reported_not_discarded() {
    let dir = tempdir().unwrap();
    {
        let store = open(dir.path());
        store.enroll("a", "Alice", true, EnrollMode::Create).unwrap();
        store.add_template("a", fv(&[1.0, 0.0, 0.0]), 0.9, "x").unwrap();
    }
    fs::remove_file(dir.path().join(codec::METADATA_FILE)).unwrap();
    let blobs_before = file_names(dir.path());
    assert_eq!(blobs_before.len(), 1);

    let err = TemplateStore::open(dir.path(), StoreOptions::new(3)).unwrap_err();
    assert!(matches!(err, StoreError::CorruptStore(_)), "{err}");
    assert_eq!(file_names(dir.path()), blobs_before);
}

fn file_names(dir: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .flatten()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
