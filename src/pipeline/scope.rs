//! LIFO release of the resources a pipeline acquires.
//!
//! Stages push what they borrow onto a [`ResourceScope`]. `release_to`
//! gives back everything acquired since a mark, newest first; whatever is
//! still held when the scope drops (the pipeline returned early, timed out
//! or was cancelled) is released the same way. A failing release is logged
//! and the remaining resources are still released.

use crate::providers::handle::ProviderLease;
use tracing::{trace, warn};

/// Something that has to be handed back when a pipeline is done with it.
pub trait Release: Send {
    fn release(self) -> Result<(), String>;
}

impl Release for ProviderLease {
    fn release(self) -> Result<(), String> {
        let closed = self.pool_closed();
        let pool = self.pool_name().to_string();
        drop(self);
        if closed {
            Err(format!("pool '{}' closed, handle destroyed instead of returned", pool))
        } else {
            Ok(())
        }
    }
}

pub struct ResourceScope<R: Release> {
    pipeline: String,
    held: Vec<(&'static str, R)>,
}

impl<R: Release> ResourceScope<R> {
    pub fn new(pipeline: impl Into<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
            held: Vec::new(),
        }
    }

    /// Take ownership of a resource until released, and lend it back.
    pub fn hold(&mut self, stage: &'static str, resource: R) -> &mut R {
        let index = self.held.len();
        self.held.push((stage, resource));
        &mut self.held[index].1
    }

    pub fn mark(&self) -> usize {
        self.held.len()
    }

    /// Release everything acquired after `mark`, newest first.
    pub fn release_to(&mut self, mark: usize) {
        while self.held.len() > mark {
            if let Some((stage, resource)) = self.held.pop() {
                match resource.release() {
                    Ok(()) => trace!(pipeline = %self.pipeline, stage, "Released resource"),
                    Err(err) => warn!(pipeline = %self.pipeline, stage, error = %err, "Resource release failed"),
                }
            }
        }
    }

    pub fn release_all(&mut self) {
        self.release_to(0);
    }

    pub fn held(&self) -> usize {
        self.held.len()
    }
}

impl<R: Release> Drop for ResourceScope<R> {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Tracked {
        name: &'static str,
        fail: bool,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Release for Tracked {
        fn release(self) -> Result<(), String> {
            self.log.lock().push(self.name);
            if self.fail {
                Err(format!("{} refused", self.name))
            } else {
                Ok(())
            }
        }
    }

    fn tracked(name: &'static str, fail: bool, log: &Arc<Mutex<Vec<&'static str>>>) -> Tracked {
        Tracked { name, fail, log: Arc::clone(log) }
    }

    #[test]
    fn test_drop_releases_in_reverse_order_despite_failures() {
        let log = Arc::new(Mutex::new(Vec::new()));
        {
            let mut scope = ResourceScope::new("p1");
            scope.hold("recognize", tracked("a", false, &log));
            scope.hold("translate", tracked("b", true, &log));
            scope.hold("synthesize", tracked("c", false, &log));
        }
        assert_eq!(*log.lock(), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_release_to_mark_keeps_older_resources() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut scope = ResourceScope::new("p2");
        scope.hold("recognize", tracked("a", false, &log));
        let mark = scope.mark();
        scope.hold("translate", tracked("b", false, &log));
        scope.hold("translate", tracked("c", false, &log));

        scope.release_to(mark);
        assert_eq!(*log.lock(), vec!["c", "b"]);
        assert_eq!(scope.held(), 1);

        drop(scope);
        assert_eq!(*log.lock(), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_hold_lends_resource_back() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut scope = ResourceScope::new("p3");
        let resource = scope.hold("recognize", tracked("a", false, &log));
        resource.fail = true;
        scope.release_all();
        assert_eq!(*log.lock(), vec!["a"]);
        assert_eq!(scope.held(), 0);
    }
}
