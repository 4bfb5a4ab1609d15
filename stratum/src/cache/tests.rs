use super::*;
use crate::error::MetadataError;

fn snode_image() -> Vec<u8> {
    let mut image = vec![0; SymbolNode::image_size(&FileConfig::default())];
    image[..8].copy_from_slice(b"SNOD\x01\x00\x00\x00");
    image
}

#[tokio::test]
async fn it_loads_on_demand() {
    let mut store = MemoryStore::new();
    store
        .write(Addr::new(1024), &snode_image())
        .await
        .expect("writes");
    let mut cache = MetadataCache::new(FileConfig::default(), false);
    assert!(!cache.contains(Addr::new(1024)));

    cache
        .load::<SymbolNode, _>(&mut store, Addr::new(1024), &())
        .await
        .expect("loads");
    assert_eq!(cache.client_at(Addr::new(1024)), Some(ClientId::SymbolNode));
    assert_eq!(cache.entry_size(Addr::new(1024)).expect("resident"), 328);
    assert!(!cache.is_dirty(Addr::new(1024)).expect("resident"));
    assert!(cache
        .get::<SymbolNode>(Addr::new(1024))
        .expect("resident")
        .entries()
        .is_empty());

    // resident entries are not read again
    store.write(Addr::new(1024), b"XXXX").await.expect("writes");
    cache
        .load::<SymbolNode, _>(&mut store, Addr::new(1024), &())
        .await
        .expect("loads");
}

#[tokio::test]
async fn it_refuses_undefined_address() {
    let mut store = MemoryStore::new();
    let mut cache = MetadataCache::new(FileConfig::default(), false);
    assert!(matches!(
        cache.load::<SymbolNode, _>(&mut store, Addr::UNDEF, &()).await,
        Err(MetadataError::Cache(CacheError::NotResident(_)))
    ));
}

#[tokio::test]
async fn it_leaves_nothing_behind_on_decode_failure() {
    let mut store = MemoryStore::new();
    store.write(Addr::new(0), b"SNOX").await.expect("writes");
    let mut cache = MetadataCache::new(FileConfig::default(), false);
    assert!(matches!(
        cache.load::<SymbolNode, _>(&mut store, Addr::new(0), &()).await,
        Err(MetadataError::BadSignature(_))
    ));
    assert!(cache.is_empty());
}

#[test]
fn it_reports_wrong_type() {
    let mut cache = MetadataCache::new(FileConfig::default(), false);
    cache
        .insert(Addr::new(64), SymbolNode::default(), false)
        .expect("inserts");
    match cache.get::<ObjectHeader>(Addr::new(64)) {
        Err(MetadataError::Cache(CacheError::WrongType {
            addr,
            wanted,
            found,
        })) => {
            assert_eq!(addr, Addr::new(64));
            assert_eq!(wanted, ClientId::ObjectHeader);
            assert_eq!(found, ClientId::SymbolNode);
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn it_refuses_double_insert() {
    let mut cache = MetadataCache::new(FileConfig::default(), false);
    cache
        .insert(Addr::new(64), SymbolNode::default(), false)
        .expect("inserts");
    assert!(matches!(
        cache.insert(Addr::new(64), SymbolNode::default(), false),
        Err(MetadataError::Cache(CacheError::AlreadyResident(_)))
    ));
}

#[tokio::test]
async fn it_protects_entries() {
    let mut store = MemoryStore::new();
    let mut cache = MetadataCache::new(FileConfig::default(), false);
    let addr = Addr::new(512);
    cache
        .insert(addr, SymbolNode::default(), false)
        .expect("inserts");
    cache.flush(&mut store).await.expect("flushes");

    cache
        .protect::<SymbolNode, _>(&mut store, addr, &())
        .await
        .expect("protects");
    assert!(cache.is_protected(addr).expect("resident"));
    assert!(matches!(
        cache.protect::<SymbolNode, _>(&mut store, addr, &()).await,
        Err(MetadataError::Cache(CacheError::Protected(_)))
    ));
    assert!(matches!(
        cache.expunge(addr),
        Err(MetadataError::Cache(CacheError::Protected(_)))
    ));
    assert!(matches!(
        cache.move_entry(addr, Addr::new(4096)),
        Err(MetadataError::Cache(CacheError::Protected(_)))
    ));
    // protected entries survive eviction
    cache.evict(&mut store).await.expect("evicts");
    assert!(cache.contains(addr));

    cache.unprotect(addr, false).expect("unprotects");
    assert!(!cache.is_dirty(addr).expect("resident"));
    assert!(matches!(
        cache.unprotect(addr, false),
        Err(MetadataError::Cache(CacheError::NotProtected(_)))
    ));
}

#[tokio::test]
async fn it_refuses_to_flush_protected_dirty_entry() {
    let mut store = MemoryStore::new();
    let mut cache = MetadataCache::new(FileConfig::default(), false);
    let addr = Addr::new(512);
    cache
        .insert(addr, SymbolNode::default(), false)
        .expect("inserts");
    cache
        .protect::<SymbolNode, _>(&mut store, addr, &())
        .await
        .expect("protects");
    assert!(matches!(
        cache.flush(&mut store).await,
        Err(MetadataError::Cache(CacheError::Protected(_)))
    ));
    cache.unprotect(addr, true).expect("unprotects");
    cache.flush(&mut store).await.expect("flushes");
    assert!(!cache.is_dirty(addr).expect("resident"));
}

#[tokio::test]
async fn it_flushes_in_address_order() {
    let mut store = MemoryStore::new();
    let mut cache = MetadataCache::new(FileConfig::default(), false);
    for addr in [2048, 512, 1024] {
        cache
            .insert(Addr::new(addr), SymbolNode::default(), false)
            .expect("inserts");
    }
    cache.flush(&mut store).await.expect("flushes");
    assert_eq!(
        store.writes(),
        &[Addr::new(512), Addr::new(1024), Addr::new(2048)]
    );
    assert_eq!(&store.bytes()[512..512 + 328], &snode_image()[..]);

    // clean entries are not written again
    cache.flush(&mut store).await.expect("flushes");
    assert_eq!(store.writes().len(), 3);
}

#[tokio::test]
async fn it_refuses_to_write_read_only() {
    let mut store = MemoryStore::new();
    store.write(Addr::new(0), &snode_image()).await.expect("writes");
    let mut cache = MetadataCache::new(FileConfig::default(), true);
    assert!(cache.read_only());
    cache
        .load::<SymbolNode, _>(&mut store, Addr::new(0), &())
        .await
        .expect("loads");
    // nothing dirty, nothing written
    cache.flush(&mut store).await.expect("flushes");

    cache.mark_dirty(Addr::new(0)).expect("resident");
    assert!(matches!(
        cache.flush(&mut store).await,
        Err(MetadataError::Cache(CacheError::ReadOnly(_)))
    ));
    assert_eq!(store.writes().len(), 1);
}

#[tokio::test]
async fn it_keeps_pinned_entries() {
    let mut store = MemoryStore::new();
    let mut cache = MetadataCache::new(FileConfig::default(), false);
    cache
        .insert(Addr::new(512), SymbolNode::default(), true)
        .expect("inserts");
    cache
        .insert(Addr::new(1024), SymbolNode::default(), false)
        .expect("inserts");
    assert!(matches!(
        cache.pin(Addr::new(512)),
        Err(MetadataError::Cache(CacheError::Pinned(_)))
    ));
    assert!(matches!(
        cache.expunge(Addr::new(512)),
        Err(MetadataError::Cache(CacheError::Pinned(_)))
    ));

    cache.evict(&mut store).await.expect("evicts");
    assert_eq!(cache.addresses().collect::<Vec<_>>(), vec![Addr::new(512)]);
    // pinned entries are still written
    assert_eq!(store.writes(), &[Addr::new(512), Addr::new(1024)]);

    cache.unpin(Addr::new(512)).expect("unpins");
    assert!(matches!(
        cache.unpin(Addr::new(512)),
        Err(MetadataError::Cache(CacheError::NotPinned(_)))
    ));
    cache.evict(&mut store).await.expect("evicts");
    assert!(cache.is_empty());
}

#[tokio::test]
async fn it_evicts_only_clean_entries() {
    let mut store = MemoryStore::new();
    let mut cache = MetadataCache::new(FileConfig::default(), false);
    cache
        .insert(Addr::new(512), SymbolNode::default(), false)
        .expect("inserts");
    cache.flush(&mut store).await.expect("flushes");
    cache
        .insert(Addr::new(1024), SymbolNode::default(), false)
        .expect("inserts");
    cache.evict_clean().expect("evicts");
    assert_eq!(cache.addresses().collect::<Vec<_>>(), vec![Addr::new(1024)]);
    assert_eq!(store.writes().len(), 1);
}

#[tokio::test]
async fn it_moves_and_resizes_entries() {
    let mut store = MemoryStore::new();
    let mut cache = MetadataCache::new(FileConfig::default(), false);
    cache
        .insert(Addr::new(512), SymbolNode::default(), false)
        .expect("inserts");
    cache.flush(&mut store).await.expect("flushes");

    cache
        .move_entry(Addr::new(512), Addr::new(4096))
        .expect("moves");
    assert!(!cache.contains(Addr::new(512)));
    assert!(cache.is_dirty(Addr::new(4096)).expect("resident"));
    cache
        .insert(Addr::new(8192), SymbolNode::default(), false)
        .expect("inserts");
    assert!(matches!(
        cache.move_entry(Addr::new(4096), Addr::new(8192)),
        Err(MetadataError::Cache(CacheError::AlreadyResident(_)))
    ));

    // a registered size that disagrees with the client is corrected on flush
    cache.resize(Addr::new(4096), 100).expect("resizes");
    assert_eq!(cache.entry_size(Addr::new(4096)).expect("resident"), 100);
    cache.flush(&mut store).await.expect("flushes");
    assert_eq!(cache.entry_size(Addr::new(4096)).expect("resident"), 328);
    assert_eq!(&store.bytes()[4096..4096 + 328], &snode_image()[..]);
}

#[test]
fn it_reports_missing_entries() {
    let mut cache = MetadataCache::new(FileConfig::default(), false);
    let addr = Addr::new(512);
    assert!(matches!(
        cache.get::<SymbolNode>(addr),
        Err(MetadataError::Cache(CacheError::NotResident(_)))
    ));
    assert!(matches!(
        cache.mark_dirty(addr),
        Err(MetadataError::Cache(CacheError::NotResident(_)))
    ));
    assert!(matches!(
        cache.expunge(addr),
        Err(MetadataError::Cache(CacheError::NotResident(_)))
    ));
    assert!(cache.is_pinned(addr).is_err());
}
