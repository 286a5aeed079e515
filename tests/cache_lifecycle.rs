// Library-level scenarios: shared cache files, vector lifecycles, and generation retention.
use std::cell::RefCell;
use std::rc::Rc;

use logcache::core::cache_file::ByteRange;
use logcache::{
    CachableDataVector, ErrorKind, GenerationRegistry, LogCacheConfig, LogDataHandler, LogVariable,
    MultiDataVectorCache,
};

#[test]
fn vectors_share_one_file_and_reuse_their_slots() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cache = MultiDataVectorCache::shared(temp.path().join("cf0"));

    let mut first = CachableDataVector::new(vec![1.0, 2.0, 3.0], Some(cache.clone()), true);
    let second = CachableDataVector::new(vec![4.0, 5.0], Some(cache.clone()), true);
    assert_eq!(first.cached_range(), Some(ByteRange::new(0, 24)));
    assert_eq!(second.cached_range(), Some(ByteRange::new(24, 16)));
    assert_eq!(cache.num_subscribers(), 2);

    first.replace_data(vec![9.0, 8.0]).expect("shorter replace");
    assert_eq!(first.cached_range(), Some(ByteRange::new(0, 16)));
    assert_eq!(cache.cache_size(), 40);
    assert_eq!(first.to_vec().expect("first"), vec![9.0, 8.0]);
    assert_eq!(second.to_vec().expect("second"), vec![4.0, 5.0]);

    first.replace_data(vec![1.0, 1.0, 1.0, 1.0]).expect("longer replace");
    assert_eq!(first.cached_range(), Some(ByteRange::new(40, 32)));
    assert_eq!(cache.cache_size(), 72);
    assert_eq!(second.to_vec().expect("second"), vec![4.0, 5.0]);
}

#[test]
fn last_vector_drop_deletes_the_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("cf0");
    let cache = MultiDataVectorCache::shared(&path);

    let first = CachableDataVector::new(vec![1.0], Some(cache.clone()), true);
    let second = CachableDataVector::new(vec![2.0], Some(cache.clone()), true);
    drop(first);
    assert!(path.exists());
    drop(second);
    assert!(!path.exists());
    assert!(cache.is_removed());

    let err = cache.append_vector(&[3.0]).expect_err("removed cache");
    assert_eq!(err.kind(), ErrorKind::Io);
    assert!(cache.has_error());
}

#[test]
fn toggling_between_memory_and_disk_keeps_data() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cache = MultiDataVectorCache::shared(temp.path().join("cf0"));
    let mut vector = CachableDataVector::new(vec![0.5, 1.5], Some(cache.clone()), false);
    assert!(!vector.is_cached());
    assert_eq!(cache.cache_size(), 0);

    vector.set_cached(true).expect("to disk");
    vector.set_cached(false).expect("to memory");
    vector.poke(1, 2.5).expect("poke memory");
    vector.set_cached(true).expect("back to disk");
    assert_eq!(vector.cached_range(), Some(ByteRange::new(0, 16)));
    assert_eq!(cache.cache_size(), 16);

    let mut text = Vec::new();
    vector.stream_data_to(&mut text, ",").expect("stream");
    assert_eq!(String::from_utf8(text).expect("utf8"), "0.5,2.5");
}

#[test]
fn whole_vector_transform_keeps_length() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cache = MultiDataVectorCache::shared(temp.path().join("cf0"));
    let mut vector = CachableDataVector::new(vec![1.0, 2.0, 3.0], Some(cache.clone()), true);

    cache.begin_multi_read_write().expect("session");
    {
        let mut op = vector.begin_full_vector_operation().expect("begin");
        op.iter_mut().for_each(|value| *value *= 10.0);
        op.finish().expect("finish");
    }
    let mut op = vector.begin_full_vector_operation().expect("begin");
    op.push(40.0);
    let err = op.finish().expect_err("grown");
    assert_eq!(err.kind(), ErrorKind::SizeMismatch);
    cache.end_multi_read_write();

    assert_eq!(vector.to_vec().expect("read"), vec![10.0, 20.0, 30.0]);
    assert_eq!(cache.num_checked_out(), 0);
}

#[test]
fn registry_purge_keeps_protected_generations() {
    let mut registry = GenerationRegistry::new("tank.level");
    for generation in 1..=10 {
        let data = CachableDataVector::in_memory(vec![f64::from(generation)]);
        registry.add_generation(generation, LogVariable::shared("tank.level", data));
    }
    registry.prevent_auto_remove(3);
    registry.prevent_auto_remove(7);

    let purged = Rc::new(RefCell::new(Vec::new()));
    for generation in registry.generations().collect::<Vec<_>>() {
        let sink = Rc::clone(&purged);
        let handle = registry.get_generation(generation).expect("handle");
        handle.on_removal(move |notice| sink.borrow_mut().push(notice.generation));
    }

    let outcome = registry.purge_old_generations(10, 2);
    assert_eq!(outcome.removed, 6);
    assert_eq!(registry.generations().collect::<Vec<_>>(), vec![3, 7, 9, 10]);
    assert_eq!(*purged.borrow(), vec![1, 2, 4, 5, 6, 8]);
    assert_eq!(
        registry.get_generation(-1).and_then(|handle| handle.generation()),
        Some(10)
    );
}

#[test]
fn handler_runs_keep_plotted_data_alive() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = LogCacheConfig::default()
        .with_cache_dir(temp.path())
        .with_generation_limit(1);
    let mut handler = LogDataHandler::new(config).expect("handler");

    handler
        .log_generation([("valve.x", vec![0.0, 0.1, 0.2])])
        .expect("first run");
    let plotted = handler.variable("valve.x", -1).expect("plotted");
    let removed = Rc::new(RefCell::new(false));
    let flag = Rc::clone(&removed);
    plotted.on_removal(move |_| *flag.borrow_mut() = true);

    handler
        .log_generation([("valve.x", vec![1.0, 1.1, 1.2])])
        .expect("second run");
    assert!(*removed.borrow());
    assert!(plotted.is_removed());
    assert_eq!(handler.generation_numbers(), vec![1]);
    assert_eq!(plotted.to_vec().expect("still readable"), vec![0.0, 0.1, 0.2]);

    let cache_dir = handler.cache_dir().to_path_buf();
    drop(handler);
    assert!(cache_dir.exists());
    drop(plotted);
    assert!(!cache_dir.join("cf0").exists());
    // Nothing removes the directory after the last outside holder drops.
    assert!(cache_dir.exists());
    assert_eq!(std::fs::read_dir(&cache_dir).expect("read dir").count(), 0);
}
