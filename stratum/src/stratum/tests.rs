use std::str::FromStr;

use super::*;

fn cleanup(path: &str) {
    std::fs::remove_file(path).expect("cleanup");
}

#[tokio::test]
async fn it_creates_and_reopens_file() {
    let path = "stratum_reopen.h5s";
    let mut file = Stratum::try_new(path, FileConfig::default())
        .await
        .expect("creates file");
    let root = file.root();
    assert!(root.is_defined());
    let alpha = file.create_group(root, "alpha").await.expect("creates");
    let beta = file.create_group(alpha, "beta").await.expect("creates");
    file.close().await.expect("closes");

    let mut file = Stratum::try_open(path, OpenMode::ReadOnly)
        .await
        .expect("opens file");
    assert_eq!(file.root(), root);
    assert_eq!(file.config(), &FileConfig::default());
    assert_eq!(file.lookup_path("/alpha/beta").await.expect("looks up"), Some(beta));
    assert_eq!(file.lookup_path("alpha").await.expect("looks up"), Some(alpha));
    assert_eq!(file.lookup_path("/").await.expect("looks up"), Some(root));
    assert_eq!(file.lookup(root, "gamma").await.expect("looks up"), None);
    assert_eq!(file.lookup_path("/alpha/gamma/delta").await.expect("looks up"), None);
    assert_eq!(
        file.links(root).await.expect("lists"),
        vec![("alpha".to_string(), alpha)]
    );
    // the root group carries its symbol table and a modification time
    let messages = file.messages(root).await.expect("reads");
    assert!(messages.iter().any(|m| matches!(m, Message::SymbolTable(_))));
    assert!(messages.iter().any(|m| matches!(m, Message::MtimeNew(_))));
    drop(file);
    cleanup(path);
}

#[test_log::test(tokio::test)]
async fn it_grows_groups() {
    let path = "stratum_grow.h5s";
    let mut file = Stratum::try_new(path, FileConfig::default())
        .await
        .expect("creates file");
    let root = file.root();
    let mut made = vec![];
    for i in 0..40 {
        let name = format!("group{i:02}");
        let addr = file.create_group(root, &name).await.expect("creates");
        made.push((name, addr));
    }
    file.flush().await.expect("flushes");
    let eoa = file.eoa();
    drop(file);

    let mut file = Stratum::try_open(path, OpenMode::ReadWrite)
        .await
        .expect("opens file");
    assert_eq!(file.eoa(), eoa);
    assert_eq!(file.links(root).await.expect("lists"), made);
    for (name, addr) in &made {
        assert_eq!(file.lookup(root, name).await.expect("looks up"), Some(*addr));
    }
    file.close().await.expect("closes");
    cleanup(path);
}

#[tokio::test]
async fn it_counts_hard_links() {
    let path = "stratum_links.h5s";
    let mut file = Stratum::try_new(path, FileConfig::default())
        .await
        .expect("creates file");
    let root = file.root();
    let alpha = file.create_group(root, "alpha").await.expect("creates");
    file.insert_link(root, "also_alpha", alpha)
        .await
        .expect("links");
    assert!(matches!(
        file.insert_link(root, "alpha", alpha).await,
        Err(MetadataError::BadValue(_))
    ));
    file.close().await.expect("closes");

    let mut file = Stratum::try_open(path, OpenMode::ReadOnly)
        .await
        .expect("opens file");
    assert_eq!(
        file.lookup(root, "also_alpha").await.expect("looks up"),
        Some(alpha)
    );
    file.messages(alpha).await.expect("reads");
    let header = file.cache().get::<ObjectHeader>(alpha).expect("resident");
    assert_eq!(header.nlink(), 2);
    drop(file);
    cleanup(path);
}

#[tokio::test]
async fn it_refuses_to_treat_object_as_group() {
    let path = "stratum_not_group.h5s";
    let mut file = Stratum::try_new(path, FileConfig::default())
        .await
        .expect("creates file");
    let heap = file.group_of(file.root()).await.expect("group").heap;
    assert!(file.group_of(heap).await.is_err());
    file.close().await.expect("closes");
    cleanup(path);
}

#[tokio::test]
async fn it_follows_a_writer() {
    let path = "stratum_swmr.h5s";
    let mut writer = Stratum::try_new(path, FileConfig::default())
        .await
        .expect("creates file");
    let root = writer.root();
    let alpha = writer.create_group(root, "alpha").await.expect("creates");
    writer.flush().await.expect("flushes");

    let mut reader = Stratum::try_open(path, OpenMode::ReadOnly)
        .await
        .expect("opens file");
    assert_eq!(reader.mode(), OpenMode::ReadOnly);
    assert_eq!(reader.lookup(root, "alpha").await.expect("looks up"), Some(alpha));
    assert_eq!(reader.lookup(root, "beta").await.expect("looks up"), None);

    let beta = writer.create_group(root, "beta").await.expect("creates");
    writer.flush().await.expect("flushes");

    reader.refresh().await.expect("refreshes");
    assert_eq!(reader.eoa(), writer.eoa());
    assert_eq!(reader.lookup(root, "beta").await.expect("looks up"), Some(beta));

    assert!(matches!(
        reader.create_group(root, "gamma").await,
        Err(MetadataError::Cache(CacheError::ReadOnly(_)))
    ));
    assert!(matches!(
        writer.refresh().await,
        Err(MetadataError::BadValue(_))
    ));
    writer.close().await.expect("closes");
    reader.close().await.expect("closes");
    cleanup(path);
}

#[tokio::test]
async fn it_flushes_on_drop() {
    let path = "stratum_drop.h5s";
    let mut file = Stratum::try_new(path, FileConfig::default())
        .await
        .expect("creates file");
    let root = file.root();
    let alpha = file.create_group(root, "alpha").await.expect("creates");
    drop(file);

    let mut file = Stratum::try_open(path, OpenMode::ReadOnly)
        .await
        .expect("opens file");
    assert_eq!(file.lookup(root, "alpha").await.expect("looks up"), Some(alpha));
    drop(file);
    cleanup(path);
}

#[tokio::test]
async fn it_rejects_missing_and_foreign_files() {
    assert!(matches!(
        Stratum::try_open("stratum_missing.h5s", OpenMode::ReadOnly).await,
        Err(MetadataError::Io(_))
    ));

    let path = "stratum_foreign.h5s";
    std::fs::write(path, vec![0x42; 1024]).expect("writes");
    assert!(matches!(
        Stratum::try_open(path, OpenMode::ReadOnly).await,
        Err(MetadataError::BadSignature(_))
    ));
    cleanup(path);
}

#[tokio::test]
async fn it_rejects_bad_config() {
    let config = FileConfig {
        sym_leaf_k: 0,
        ..FileConfig::default()
    };
    assert!(Stratum::try_new("stratum_bad_config.h5s", config)
        .await
        .is_err());
    assert!(!Path::new("stratum_bad_config.h5s").exists());
}

#[tokio::test]
async fn it_prints_structures() {
    let path = "stratum_debug.h5s";
    let mut file = Stratum::try_new(path, FileConfig::default())
        .await
        .expect("creates file");
    let root = file.root();
    file.create_group(root, "alpha").await.expect("creates");
    let stab = file.group_of(root).await.expect("group");

    let mut out = vec![];
    file.header_debug(&mut out).expect("prints");
    let text = String::from_utf8(out).expect("utf8");
    assert!(text.starts_with("File Header...\n"));
    assert!(text.contains(&root.to_string()));

    for (addr, kind, title) in [
        (root, DebugKind::Ohdr, "Object Header..."),
        (stab.btree, DebugKind::BTree, "B-tree Node..."),
        (stab.heap, DebugKind::Heap, "Local Heap..."),
    ] {
        let mut out = vec![];
        file.debug(addr, kind, &mut out).await.expect("prints");
        let text = String::from_utf8(out).expect("utf8");
        assert!(text.starts_with(title), "{kind}: {text}");
    }

    file.flush().await.expect("flushes");
    assert_eq!(file.detect(root).await.expect("detects"), DebugKind::Ohdr);
    assert_eq!(file.detect(stab.btree).await.expect("detects"), DebugKind::BTree);
    assert_eq!(file.detect(stab.heap).await.expect("detects"), DebugKind::Heap);

    // nothing is printed for an address which holds no free space manager
    let mut out = vec![];
    file.debug(Addr::new(12345), DebugKind::Fs, &mut out)
        .await
        .expect("prints");
    assert!(out.is_empty());

    // the wrong kind of structure is reported, not misread
    let mut out = vec![];
    assert!(file
        .debug(root, DebugKind::Snode, &mut out)
        .await
        .is_err());

    file.close().await.expect("closes");
    cleanup(path);
}

#[test]
fn it_parses_names() {
    assert_eq!(DebugKind::from_str("btree").expect("parses"), DebugKind::BTree);
    assert_eq!(DebugKind::from_str("SNODE").expect("parses"), DebugKind::Snode);
    assert_eq!(DebugKind::Fs.to_string(), "fs");
    assert_eq!(OpenMode::from_str("readonly").expect("parses"), OpenMode::ReadOnly);
    assert!(DebugKind::from_str("dataset").is_err());
}
