// Group config tests: file and inline forms, validation, guessing

use std::fs;
use std::path::PathBuf;

use lattice_core::{Error, ErrorCategory, GroupConfig, GroupConfigItem};

// Helper: write a scratch config file under the system temp dir

fn scratch(name: &str, text: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "lattice-group-config-{}-{name}.txt",
        std::process::id()
    ));
    fs::write(&path, text).unwrap();
    path
}

#[test]
fn test_load_file() {
    let path = scratch(
        "load",
        "# group_id embedding_row embedding_col\n\
         1 1000 8\n\
         \n\
         // the next group is wide\n\
         7 200 16\n",
    );
    let config = GroupConfig::load(&path).unwrap();
    fs::remove_file(&path).unwrap();

    assert_eq!(
        config.items(),
        &[
            GroupConfigItem::new(1, 1000, 8),
            GroupConfigItem::new(7, 200, 16)
        ]
    );
    assert_eq!(config.max_group_id(), 8);
    assert_eq!(config.total_embedding_col(), 24);
    assert!(!config.is_fm());
    assert!(config.check_fm().is_err());
}

#[test]
fn test_load_rejects_duplicates_with_line() {
    let path = scratch("dup", "1 10 4\n2 10 4\n1 20 4\n");
    let err = GroupConfig::load(&path).unwrap_err();
    fs::remove_file(&path).unwrap();

    match &err {
        Error::Config { line, message } => {
            assert_eq!(*line, Some(3));
            assert!(message.contains("duplicate"), "{message}");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(err.category(), ErrorCategory::Config);
}

#[test]
fn test_load_rejects_empty_and_missing() {
    let path = scratch("empty", "# nothing here\n\n");
    assert!(GroupConfig::load(&path).is_err());
    fs::remove_file(&path).unwrap();

    let missing = std::env::temp_dir().join("lattice-group-config-does-not-exist.txt");
    assert!(GroupConfig::load(missing).is_err());
}

#[test]
fn test_inline_form() {
    let config = GroupConfig::parse("1:4,2:8").unwrap();
    assert_eq!(
        config.items(),
        &[GroupConfigItem::new(1, 1, 4), GroupConfigItem::new(2, 1, 8)]
    );
    assert_eq!(config.max_group_id(), 3);
    assert!(GroupConfig::parse("1:4,2:8,1:16").is_err());
}

#[test]
fn test_fm_and_lr_views() {
    let config = GroupConfig::parse("3:100:8,5:200:8").unwrap();
    assert!(config.is_fm());
    assert_eq!(config.total_embedding_col(), 16);
    let lr = config.lr();
    assert_eq!(lr.total_embedding_col(), 2);
    assert_eq!(lr.items()[1], GroupConfigItem::new(5, 200, 1));
}

#[test]
fn test_guess_prefers_existing_file() {
    let path = scratch("guess", "4 10 2\n");
    let from_file = GroupConfig::guess(path.to_str().unwrap()).unwrap();
    fs::remove_file(&path).unwrap();
    assert_eq!(from_file.items(), &[GroupConfigItem::new(4, 10, 2)]);

    let inline = GroupConfig::guess("4:10:2").unwrap();
    assert_eq!(inline, from_file);
    assert!(GroupConfig::guess("").is_err());
}

#[test]
fn test_from_items_validates() {
    assert!(GroupConfig::from_items(vec![]).is_err());
    assert!(GroupConfig::from_items(vec![GroupConfigItem::new(1, 0, 4)]).is_err());
    assert!(GroupConfig::from_items(vec![GroupConfigItem::new(1 << 18, 1, 4)]).is_err());
    let config = GroupConfig::from_items(vec![
        GroupConfigItem::new(9, 5, 3),
        GroupConfigItem::new(2, 5, 3),
    ])
    .unwrap();
    assert_eq!(config.group_ids(), vec![9, 2]);
}
