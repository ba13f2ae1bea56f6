//! Nestable resource scopes
//!
//! A scope is an ordered stack of release callbacks. Resources acquired
//! inside `with_scope` are released in reverse registration order when the
//! scope exits, on both the normal and the unwinding path. Releases are
//! attempted for every tracked resource even when one fails; the first
//! failure is reported and the rest are counted into the same error.
//!
//! Backing stores themselves are reference counted, so a scope's release
//! step for a buffer is dropping its clone of the handle; tracking a stream
//! registers a host sync so queued device work drains before buffers
//! tracked earlier in the same scope go away.

use crate::driver::{Buffer, Stream};
use crate::error::{Error, Result};
use std::cell::{Cell, RefCell};
use std::sync::Arc;

type Release = Box<dyn FnOnce() -> Result<()>>;

struct Frame {
    entries: Vec<(u64, Release)>,
}

thread_local! {
    static SCOPES: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
    static NEXT_ID: Cell<u64> = const { Cell::new(0) };
}

/// Handle to a tracked resource, used to detach it from its scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeToken(u64);

/// Run `body` under a fresh innermost scope
///
/// All resources tracked while `body` runs are released when it returns or
/// unwinds. A release failure after a successful body surfaces as
/// `Error::Resource`; it never masks an error from the body itself.
pub fn with_scope<T>(body: impl FnOnce() -> Result<T>) -> Result<T> {
    SCOPES.with(|s| {
        s.borrow_mut().push(Frame {
            entries: Vec::new(),
        })
    });
    let mut guard = UnwindGuard { armed: true };
    let out = body();
    guard.armed = false;
    let released = pop_and_release();
    match (out, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(release_err)) => Err(release_err),
        (Err(primary), Err(release_err)) => {
            log::error!("scope release failed while propagating an error: {release_err}");
            Err(primary)
        }
        (Err(primary), Ok(())) => Err(primary),
    }
}

struct UnwindGuard {
    armed: bool,
}

impl Drop for UnwindGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = pop_and_release() {
                log::error!("scope release failed during unwind: {e}");
            }
        }
    }
}

fn pop_and_release() -> Result<()> {
    let frame = SCOPES
        .with(|s| s.borrow_mut().pop())
        .expect("scope stack underflow");
    let mut first: Option<String> = None;
    let mut failed = 0usize;
    for (_, release) in frame.entries.into_iter().rev() {
        if let Err(e) = release() {
            failed += 1;
            if first.is_none() {
                first = Some(e.to_string());
            }
        }
    }
    match first {
        None => Ok(()),
        Some(first) => Err(Error::Resource { first, failed }),
    }
}

/// True when a scope is active on this thread
pub fn in_scope() -> bool {
    SCOPES.with(|s| !s.borrow().is_empty())
}

/// Register a release callback on the innermost scope
///
/// Returns `None` when no scope is active (the resource then lives by its
/// own reference count alone).
pub fn track(release: impl FnOnce() -> Result<()> + 'static) -> Option<ScopeToken> {
    SCOPES.with(|s| {
        let mut scopes = s.borrow_mut();
        let frame = scopes.last_mut()?;
        let id = NEXT_ID.with(|n| {
            let id = n.get();
            n.set(id + 1);
            id
        });
        frame.entries.push((id, Box::new(release)));
        Some(ScopeToken(id))
    })
}

/// Keep a buffer alive until the innermost scope exits
pub fn track_buffer(buffer: Arc<dyn Buffer>) -> Option<ScopeToken> {
    track(move || {
        drop(buffer);
        Ok(())
    })
}

/// Tie a stream to the innermost scope
///
/// The release step drains the stream with `sync_with_host`, so work still
/// queued on it completes before buffers tracked earlier are released.
pub fn track_stream(stream: Arc<dyn Stream>) -> Option<ScopeToken> {
    track(move || stream.sync_with_host())
}

/// Remove a release callback from the innermost scope without running it
///
/// Returns false when the token is not registered on the innermost scope
/// (detaching across scope levels is a usage error).
pub fn detach(token: ScopeToken) -> bool {
    SCOPES.with(|s| {
        let mut scopes = s.borrow_mut();
        let Some(frame) = scopes.last_mut() else {
            return false;
        };
        match frame.entries.iter().position(|(id, _)| *id == token.0) {
            Some(pos) => {
                frame.entries.remove(pos);
                true
            }
            None => false,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn test_release_in_reverse_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let (a, b) = (order.clone(), order.clone());
        with_scope(|| {
            track(move || {
                a.borrow_mut().push("first");
                Ok(())
            });
            track(move || {
                b.borrow_mut().push("second");
                Ok(())
            });
            Ok(())
        })
        .unwrap();
        assert_eq!(*order.borrow(), ["second", "first"]);
    }

    #[test]
    fn test_release_on_failure_path() {
        let released = Rc::new(Cell::new(false));
        let r = released.clone();
        let out: Result<()> = with_scope(|| {
            track(move || {
                r.set(true);
                Ok(())
            });
            Err(Error::device("boom"))
        });
        assert!(out.is_err());
        assert!(released.get());
    }

    #[test]
    fn test_release_failures_aggregate() {
        let out: Result<()> = with_scope(|| {
            track(|| Err(Error::device("late")));
            track(|| Err(Error::device("early")));
            Ok(())
        });
        match out {
            Err(Error::Resource { first, failed }) => {
                // Reverse order: the later registration releases first
                assert!(first.contains("early"));
                assert_eq!(failed, 2);
            }
            other => panic!("expected resource error, got {other:?}"),
        }
    }

    #[test]
    fn test_primary_error_not_masked() {
        let out: Result<()> = with_scope(|| {
            track(|| Err(Error::device("release failure")));
            Err(Error::device("primary"))
        });
        match out {
            Err(Error::Device { message }) => assert_eq!(message, "primary"),
            other => panic!("expected the primary error, got {other:?}"),
        }
    }

    #[test]
    fn test_detach() {
        let released = Rc::new(Cell::new(false));
        let r = released.clone();
        with_scope(|| {
            let token = track(move || {
                r.set(true);
                Ok(())
            })
            .unwrap();
            assert!(detach(token));
            assert!(!detach(token));
            Ok(())
        })
        .unwrap();
        assert!(!released.get());
    }

    #[test]
    fn test_release_on_unwind() {
        let released = Rc::new(Cell::new(false));
        let r = released.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _: Result<()> = with_scope(|| {
                track(move || {
                    r.set(true);
                    Ok(())
                });
                panic!("unwind");
            });
        }));
        assert!(result.is_err());
        assert!(released.get());
        assert!(!in_scope());
    }
}
