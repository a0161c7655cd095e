//! The wrapping discipline (spec §4.3) and the unblock single-shot guard
//! (spec §4.3's "critical invariant").
//!
//! The source material monkey-patches methods on live host objects; this
//! is the build-time/interface-abstraction equivalent spec §9 calls out:
//! a collector captures a host-provided closure exactly once (guarded by
//! a `OnceLock` so repeated wrap attempts are idempotent, per spec §8's
//! "wrapping an already-wrapped function is the identity"), and every
//! invocation of the wrapped form calls the captured closure exactly
//! once, before or after its own bookkeeping, never retrying it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// A captured host callable, wrapped at most once per [`HostSlot`]
/// instance. `Args`/`Ret` let this serve both the zero-arg `unblock`
/// callable and richer host hooks (e.g. a query executor method) that
/// take/return values.
pub struct HostSlot<Args, Ret> {
    captured: OnceLock<Arc<dyn Fn(Args) -> Ret + Send + Sync>>,
}

impl<Args, Ret> Default for HostSlot<Args, Ret> {
    fn default() -> Self {
        Self { captured: OnceLock::new() }
    }
}

impl<Args, Ret> std::fmt::Debug for HostSlot<Args, Ret> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostSlot").field("captured", &self.captured.get().is_some()).finish()
    }
}

impl<Args, Ret> HostSlot<Args, Ret> {
    /// Capture `original` under this slot, guarded by "only if not
    /// already set" (spec §4.3 point 4). Returns `true` if this call
    /// performed the capture; `false` if a previous wrap already holds
    /// the original, in which case `original` is dropped unused — this
    /// is what makes re-wrapping idempotent.
    pub fn capture_once<F>(&self, original: F) -> bool
    where
        F: Fn(Args) -> Ret + Send + Sync + 'static,
    {
        self.captured.set(Arc::new(original)).is_ok()
    }

    /// Call the captured original, if one has been set. Calling through
    /// more than once per logical invocation is the caller's
    /// responsibility to avoid — this method itself places no limit,
    /// since ordinary host functions (unlike `unblock`) are expected to
    /// be called once per request by construction.
    pub fn call_through(&self, args: Args) -> Option<Ret> {
        self.captured.get().map(|f| f(args))
    }

    /// Whether this slot has captured an original yet.
    #[must_use]
    pub fn is_wrapped(&self) -> bool {
        self.captured.get().is_some()
    }
}

/// Single-shot guard around a host `unblock` callable (spec §4.3's
/// critical invariant).
///
/// Multiple collectors may each wrap `unblock` in turn, nesting their
/// wrappers: `tracer_wrap(queue_wrap(original))`. Calling the outermost
/// wrapper must invoke `original` exactly once, even if called twice or
/// if a collector's own bookkeeping panics/errors. This type gives each
/// layer its own independent guard — composing N of them around the same
/// captured original still yields exactly one call to `original`,
/// because the guard lives at the layer that holds the capture, not at
/// the call site.
pub struct UnblockGuard {
    original: Arc<dyn Fn() + Send + Sync>,
    invoked: AtomicBool,
}

impl std::fmt::Debug for UnblockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnblockGuard").field("invoked", &self.invoked.load(Ordering::SeqCst)).finish()
    }
}

impl UnblockGuard {
    /// Capture the host's `unblock` callable (which may itself already be
    /// another collector's wrapper).
    pub fn new<F>(original: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self { original: Arc::new(original), invoked: AtomicBool::new(false) }
    }

    /// Invoke `before` bookkeeping, call the captured original exactly
    /// once across the lifetime of this guard, and return whether this
    /// call was the one that triggered it. A bookkeeping panic is caught
    /// and logged rather than allowed to either skip the call-through or
    /// propagate into the host's call site (spec §4.3: "errors in
    /// bookkeeping must not cause the captured callable to be invoked
    /// twice and must not re-raise into a retry loop").
    pub fn invoke(&self, before: impl FnOnce()) -> bool {
        if self.invoked.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(before)) {
            tracing::warn!(?panic, "unblock bookkeeping panicked, proceeding to call through");
        }
        (self.original)();
        true
    }

    /// Whether the captured original has already been called.
    #[must_use]
    pub fn was_invoked(&self) -> bool {
        self.invoked.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn host_slot_wrap_is_idempotent() {
        let slot: HostSlot<(), u32> = HostSlot::default();
        assert!(slot.capture_once(|_| 1));
        assert!(!slot.capture_once(|_| 2));
        assert_eq!(slot.call_through(()), Some(1));
    }

    #[test]
    fn unblock_guard_invokes_original_exactly_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let guard = UnblockGuard::new(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
        });
        assert!(guard.invoke(|| {}));
        assert!(!guard.invoke(|| {}));
        assert!(!guard.invoke(|| {}));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn chained_guards_each_call_through_exactly_once() {
        // Regression for scenario 4: two independent wrappers (tracer,
        // queue collector) wrap unblock in that order. Invoking the
        // outer exactly once must invoke the inner host unblock exactly
        // once, with no stack overflow from mutual recursion.
        let inner_calls = Arc::new(AtomicU32::new(0));
        let inner_calls2 = inner_calls.clone();
        let inner_guard = Arc::new(UnblockGuard::new(move || {
            inner_calls2.fetch_add(1, Ordering::SeqCst);
        }));

        let inner_guard2 = inner_guard.clone();
        let outer_guard = UnblockGuard::new(move || {
            inner_guard2.invoke(|| {});
        });

        assert!(outer_guard.invoke(|| {}));
        assert_eq!(inner_calls.load(Ordering::SeqCst), 1);

        // Calling the outer again must not invoke the inner a second time.
        assert!(!outer_guard.invoke(|| {}));
        assert_eq!(inner_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn bookkeeping_panic_does_not_prevent_call_through() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let guard = UnblockGuard::new(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
        });
        let invoked = guard.invoke(|| panic!("bookkeeping exploded"));
        assert!(invoked);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
