use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use crate::{error::Result, ref_count::RefCount};

#[test]
fn starts_with_one_reference() {
    let count = RefCount::new("resource");
    assert_eq!(count.get(), 1);
    assert!(!count.is_released());
    assert!(count.ensure_live().is_ok());
}

#[test]
fn teardown_runs_after_last_release() {
    let count = RefCount::new("resource");
    let teardowns = AtomicUsize::new(0);
    let teardown = || -> Result<()> {
        teardowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    };

    assert_eq!(count.retain().unwrap(), 2);
    assert_eq!(count.retain().unwrap(), 3);

    count.release_then(teardown).unwrap();
    count.release_then(teardown).unwrap();
    assert_eq!(teardowns.load(Ordering::SeqCst), 0);

    count.release_then(teardown).unwrap();
    assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    assert!(count.is_released());
}

#[test]
fn over_release_is_reported() {
    let count = RefCount::new("connection");
    assert!(count.release().unwrap());

    let error = count.release().unwrap_err();
    assert!(error.is_resource_lifecycle_error());
    assert_eq!(count.get(), 0);
}

#[test]
fn retain_after_zero_is_reported() {
    let count = RefCount::new("connection");
    count.release().unwrap();

    assert!(count.retain().unwrap_err().is_resource_lifecycle_error());
    assert!(count.ensure_live().unwrap_err().is_resource_lifecycle_error());
    assert_eq!(count.get(), 0);
}

#[test]
fn teardown_error_is_returned_once() {
    let count = RefCount::new("binding");
    let result = count.release_then(|| Err(crate::error::Error::internal("close failed")));
    assert!(result.is_err());
    assert!(count.is_released());
}

#[test]
fn concurrent_releases_tear_down_exactly_once() {
    const THREADS: usize = 16;
    const PER_THREAD: usize = 250;

    for _ in 0..20 {
        let count = Arc::new(RefCount::new("resource"));
        for _ in 0..THREADS * PER_THREAD - 1 {
            count.retain().unwrap();
        }

        let teardowns = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let count = count.clone();
                let teardowns = teardowns.clone();
                std::thread::spawn(move || {
                    for _ in 0..PER_THREAD {
                        count
                            .release_then(|| {
                                teardowns.fetch_add(1, Ordering::SeqCst);
                                Ok(())
                            })
                            .unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
        assert_eq!(count.get(), 0);
    }
}
