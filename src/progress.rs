/// Synchronous progress observer. Implementations must return quickly;
/// the producer calls this inline, possibly from worker threads.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, current: u64, total: u64, label: &str);
}

impl<F> ProgressObserver for F
where
    F: Fn(u64, u64, &str) + Send + Sync,
{
    fn on_progress(&self, current: u64, total: u64, label: &str) {
        self(current, total, label)
    }
}

/// Forward to an optional observer.
pub(crate) fn report(
    observer: Option<&dyn ProgressObserver>,
    current: u64,
    total: u64,
    label: &str,
) {
    if let Some(observer) = observer {
        observer.on_progress(current, total, label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_closure_observer() {
        let last = AtomicU64::new(0);
        let observer = |current: u64, _total: u64, _label: &str| {
            last.store(current, Ordering::SeqCst);
        };
        report(Some(&observer), 7, 10, "file.bin");
        assert_eq!(last.load(Ordering::SeqCst), 7);
        report(None, 9, 10, "ignored");
        assert_eq!(last.load(Ordering::SeqCst), 7);
    }
}
