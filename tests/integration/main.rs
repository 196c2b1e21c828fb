//! Integration tests for Kiln

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

mod cache_concurrency {
    use super::init_tracing;
    use kiln::{Command, FileCache, Inputs, QueryEvent};
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use tempfile::TempDir;

    fn inputs_for(value: &str) -> Inputs {
        Inputs::builder(Command::Test)
            .put_string("file", value)
            .unwrap()
            .build()
            .unwrap()
    }

    #[test]
    fn same_key_runs_action_exactly_once() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let cache = FileCache::with_single_process_locking(dir.path().join("cache")).unwrap();
        let runs = AtomicUsize::new(0);
        let threads = 8;
        let barrier = Barrier::new(threads);

        std::thread::scope(|scope| {
            for _ in 0..threads {
                scope.spawn(|| {
                    barrier.wait();
                    let result = cache
                        .create_file_in_cache_if_absent(&inputs_for("input"), |p| {
                            runs.fetch_add(1, Ordering::SeqCst);
                            fs::write(p, "artifact").map_err(Into::into)
                        })
                        .unwrap();
                    assert!(matches!(
                        result.event(),
                        QueryEvent::Hit | QueryEvent::Missed
                    ));
                });
            }
        });

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.hits(), threads as u64 - 1);
    }

    #[test]
    fn different_keys_run_concurrently() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let cache = FileCache::with_single_process_locking(dir.path().join("cache")).unwrap();
        let threads = 4;
        // Every action must be in flight at once for the barrier to clear;
        // cross-key serialization would deadlock here.
        let in_action = Barrier::new(threads);

        std::thread::scope(|scope| {
            for i in 0..threads {
                let cache = &cache;
                let in_action = &in_action;
                scope.spawn(move || {
                    cache
                        .create_file_in_cache_if_absent(
                            &inputs_for(&format!("input-{}", i)),
                            |p| {
                                in_action.wait();
                                fs::write(p, "artifact").map_err(Into::into)
                            },
                        )
                        .unwrap();
                });
            }
        });

        assert_eq!(cache.misses(), threads as u64);
    }

    #[test]
    fn separate_instances_do_not_share_lock_state() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let cache_dir = dir.path().join("cache");
        let a = FileCache::with_single_process_locking(&cache_dir).unwrap();
        let b = FileCache::with_single_process_locking(&cache_dir).unwrap();
        // Both actions must overlap, proving neither instance blocks the
        // other even on the same key and directory.
        let in_action = Barrier::new(2);

        std::thread::scope(|scope| {
            for cache in [&a, &b] {
                let in_action = &in_action;
                scope.spawn(move || {
                    cache
                        .create_file_in_cache_if_absent(&inputs_for("input"), |p| {
                            in_action.wait();
                            fs::write(p, "artifact").map_err(Into::into)
                        })
                        .unwrap();
                });
            }
        });

        assert_eq!(a.misses() + b.misses(), 2);
    }

    #[test]
    fn multi_process_instances_serialize_on_same_key() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let cache_dir = dir.path().join("cache");
        let a = FileCache::with_multi_process_locking(&cache_dir).unwrap();
        let b = FileCache::with_multi_process_locking(&cache_dir).unwrap();
        let runs = AtomicUsize::new(0);
        let start = Barrier::new(2);

        // Advisory locks make distinct instances behave like one: exactly
        // one populates, the other re-checks and observes the hit.
        std::thread::scope(|scope| {
            for cache in [&a, &b] {
                let start = &start;
                let runs = &runs;
                scope.spawn(move || {
                    start.wait();
                    cache
                        .create_file_in_cache_if_absent(&inputs_for("input"), |p| {
                            runs.fetch_add(1, Ordering::SeqCst);
                            fs::write(p, "artifact").map_err(Into::into)
                        })
                        .unwrap();
                });
            }
        });

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(a.hits() + b.hits(), 1);
        assert_eq!(a.misses() + b.misses(), 1);
    }
}

mod cache_scenarios {
    use super::init_tracing;
    use kiln::{
        CacheSession, Command, DirectoryProperties, FileCache, FileProperties, Inputs, QueryEvent,
    };
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[test]
    fn file_input_change_triggers_rebuild() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let cache = FileCache::with_single_process_locking(dir.path().join("cache")).unwrap();
        let source = dir.path().join("source.txt");
        let output = dir.path().join("output");
        let runs = AtomicUsize::new(0);

        let build = |expected: &str| {
            let inputs = Inputs::builder(Command::GenerateSources)
                .put_file("source", &source, FileProperties::Hash)
                .unwrap()
                .put_bool("debuggable", true)
                .unwrap()
                .build()
                .unwrap();
            cache
                .create_file(&output, &inputs, || {
                    runs.fetch_add(1, Ordering::SeqCst);
                    let text = fs::read_to_string(&source)?.to_uppercase();
                    fs::write(&output, text).map_err(Into::into)
                })
                .unwrap();
            assert_eq!(fs::read_to_string(&output).unwrap(), expected);
        };

        fs::write(&source, "one").unwrap();
        build("ONE");
        build("ONE");
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        fs::write(&source, "two").unwrap();
        build("TWO");
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        // Back to the original content: the old entry is still valid.
        fs::write(&source, "one").unwrap();
        build("ONE");
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn directory_input_change_triggers_rebuild() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let cache = FileCache::with_single_process_locking(dir.path().join("cache")).unwrap();
        let resources = dir.path().join("res");
        fs::create_dir_all(resources.join("values")).unwrap();
        fs::write(resources.join("values/strings.txt"), "hello").unwrap();
        let runs = AtomicUsize::new(0);

        let build = |runs: &AtomicUsize| {
            let inputs = Inputs::builder(Command::ExtractArchive)
                .put_directory("res", &resources, DirectoryProperties::Hash)
                .unwrap()
                .build()
                .unwrap();
            cache
                .create_file_in_cache_if_absent(&inputs, |p| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    fs::write(p, "packed").map_err(Into::into)
                })
                .unwrap()
        };

        assert_eq!(build(&runs).event(), QueryEvent::Missed);
        assert_eq!(build(&runs).event(), QueryEvent::Hit);

        fs::rename(
            resources.join("values/strings.txt"),
            resources.join("values/renamed.txt"),
        )
        .unwrap();
        assert_eq!(build(&runs).event(), QueryEvent::Missed);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn session_keeps_key_stable_within_scope() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("tree");
        fs::create_dir(&source).unwrap();
        fs::write(source.join("a.txt"), "a").unwrap();

        let session = CacheSession::new();
        let key_of = |session: &CacheSession| {
            Inputs::builder_with_session(Command::Test, session.clone())
                .put_directory("src", &source, DirectoryProperties::Hash)
                .unwrap()
                .build()
                .unwrap()
                .key()
        };

        let before = key_of(&session);
        fs::write(source.join("b.txt"), "b").unwrap();

        // Same session: stable key. A fresh session re-walks the tree.
        assert_eq!(before, key_of(&session));
        assert_ne!(before, key_of(&CacheSession::new()));
    }

    #[test]
    fn corruption_self_heals_end_to_end() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let cache = FileCache::with_single_process_locking(dir.path().join("cache")).unwrap();
        let output = dir.path().join("output");
        let inputs = Inputs::builder(Command::PrebuildLibrary)
            .put_string("artifact", "lib.a")
            .unwrap()
            .build()
            .unwrap();

        cache
            .create_file(&output, &inputs, || {
                fs::write(&output, "v1").map_err(Into::into)
            })
            .unwrap();

        // Simulate a crashed writer leaving a half-written sidecar.
        fs::write(
            cache.cache_dir().join(inputs.key()).join("inputs"),
            "COMMAND=prebuild_",
        )
        .unwrap();
        assert!(!cache.cache_entry_exists(&inputs).unwrap());

        let result = cache
            .create_file(&output, &inputs, || {
                fs::write(&output, "v2").map_err(Into::into)
            })
            .unwrap();

        assert_eq!(result.event(), QueryEvent::Corrupted);
        assert!(result.corruption_cause().is_some());
        assert_eq!(fs::read_to_string(&output).unwrap(), "v2");
        assert!(cache.cache_entry_exists(&inputs).unwrap());
    }
}

mod locking_scenarios {
    use super::init_tracing;
    use kiln::{LockScope, SyncFile};
    use std::fs;
    use std::sync::Barrier;
    use tempfile::TempDir;

    #[test]
    fn mixed_handles_one_path_stay_consistent() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.txt");
        fs::write(&path, "0").unwrap();

        let writers = 4;
        let readers = 4;
        std::thread::scope(|scope| {
            for _ in 0..writers {
                let path = &path;
                scope.spawn(move || {
                    let handle = SyncFile::new(path, LockScope::SingleProcess).unwrap();
                    handle
                        .write(|p| {
                            let n: u64 = fs::read_to_string(p)?.parse()?;
                            fs::write(p, (n + 1).to_string())?;
                            Ok(())
                        })
                        .unwrap();
                });
            }
            for _ in 0..readers {
                let path = &path;
                scope.spawn(move || {
                    let handle = SyncFile::new(path, LockScope::SingleProcess).unwrap();
                    handle
                        .read(|p| {
                            // Writers are never mid-write while we read.
                            let text = fs::read_to_string(p)?;
                            text.parse::<u64>()?;
                            Ok(())
                        })
                        .unwrap();
                });
            }
        });

        assert_eq!(fs::read_to_string(&path).unwrap(), writers.to_string());
    }

    #[test]
    fn multi_process_scope_readers_overlap() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shared.txt");
        fs::write(&path, "data").unwrap();
        let handle = SyncFile::new(&path, LockScope::MultiProcess).unwrap();
        let both_reading = Barrier::new(2);

        std::thread::scope(|scope| {
            for _ in 0..2 {
                let handle = &handle;
                let both_reading = &both_reading;
                scope.spawn(move || {
                    handle
                        .read(|_| {
                            both_reading.wait();
                            Ok(())
                        })
                        .unwrap();
                });
            }
        });
    }
}
