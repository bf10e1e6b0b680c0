//! Keep host objects alive while the parser holds a reference to them.
//!
//! The parser never sees host objects, only [`Handle`]s. A handle does not transfer ownership,
//! it only means "do not reclaim this yet". Handles are indices into a slot table, tagged with the
//! slot's generation so that a stale handle can never resolve to a newer object that reused its
//! slot.
use std::fmt;
use std::num::NonZeroU64;

/// An opaque, boundary-safe reference to an object in a [`HandleRegistry`].
///
/// On the wire a handle is a non-zero `u64`, `0` is reserved as the failure sentinel.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(NonZeroU64);

impl Handle {
    fn new(index: u32, generation: u32) -> Handle {
        let raw = (u64::from(generation) << 32) | (u64::from(index) + 1);
        // the low half is at least 1
        Handle(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    /// Rebuild a handle from its wire representation. Returns `None` for the null handle.
    #[must_use]
    pub fn from_raw(raw: u64) -> Option<Handle> {
        NonZeroU64::new(raw).map(Handle)
    }

    /// The wire representation of this handle.
    #[must_use]
    pub fn into_raw(self) -> u64 {
        self.0.get()
    }

    fn index(self) -> Option<usize> {
        let low = self.0.get() & u64::from(u32::MAX);
        usize::try_from(low).ok()?.checked_sub(1)
    }

    fn generation(self) -> u32 {
        (self.0.get() >> 32) as u32
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index() {
            Some(index) => write!(f, "Handle({}@{})", index, self.generation()),
            None => write!(f, "Handle(invalid {:#x})", self.0.get()),
        }
    }
}

/// When the registry lets go of an object the parser no longer references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReleasePolicy {
    /// Keep everything until the session ends. Releases from the parser are validated but
    /// otherwise ignored.
    #[default]
    AtSessionEnd,

    /// Drop the registry's reference as soon as the parser drops its own. Objects that are still
    /// attached to the tree stay alive through their parent, detached ones are reclaimed.
    WhenUnreferenced,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    object: Option<T>,
}

/// A table of host objects that are referenced from the other side of the boundary.
#[derive(Debug)]
pub struct HandleRegistry<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
    policy: ReleasePolicy,
}

impl<T> Default for HandleRegistry<T> {
    fn default() -> Self {
        HandleRegistry::new(ReleasePolicy::default())
    }
}

impl<T> HandleRegistry<T> {
    /// Create an empty registry.
    pub fn new(policy: ReleasePolicy) -> Self {
        HandleRegistry {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            policy,
        }
    }

    /// The policy this registry was created with.
    pub fn policy(&self) -> ReleasePolicy {
        self.policy
    }

    /// Number of objects currently kept alive.
    pub fn len(&self) -> usize {
        self.live
    }

    /// Whether no object is currently kept alive.
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Keep `object` alive and return a handle for it. Always succeeds.
    pub fn register(&mut self, object: T) -> Handle {
        self.live += 1;

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.object.is_none());
            slot.object = Some(object);
            return Handle::new(index, slot.generation);
        }

        let index = match u32::try_from(self.slots.len()) {
            Ok(index) if index < u32::MAX => index,
            _ => panic!("handle registry is full"),
        };
        self.slots.push(Slot {
            generation: 0,
            object: Some(object),
        });
        Handle::new(index, 0)
    }

    /// Look up the object behind `handle`, or `None` if the handle is unknown or stale.
    pub fn get(&self, handle: Handle) -> Option<&T> {
        let slot = self.slots.get(handle.index()?)?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.object.as_ref()
    }

    /// Look up the object behind `handle`.
    ///
    /// # Panics
    ///
    /// An unknown handle means one side of the boundary has a bug, this is a contract violation
    /// and not a recoverable error.
    pub fn resolve(&self, handle: Handle) -> &T {
        match self.get(handle) {
            Some(object) => object,
            None => panic!("contract violation: unknown handle {:?}", handle),
        }
    }

    /// The parser dropped its reference to `handle`.
    ///
    /// Depending on the [`ReleasePolicy`] this either does nothing or frees the slot, in which
    /// case the object is returned so the caller decides where it gets dropped.
    ///
    /// # Panics
    ///
    /// Same as [`HandleRegistry::resolve`].
    pub fn release(&mut self, handle: Handle) -> Option<T> {
        self.resolve(handle);

        match self.policy {
            ReleasePolicy::AtSessionEnd => None,
            ReleasePolicy::WhenUnreferenced => {
                let index = handle.index()?;
                let slot = &mut self.slots[index];
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
                self.live -= 1;
                slot.object.take()
            }
        }
    }

    /// Invalidate every outstanding handle at once and drop all objects.
    pub fn clear(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.object.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
            }
        }
        self.live = 0;
    }
}

#[test]
fn test_register_and_resolve() {
    let mut registry = HandleRegistry::default();
    let a = registry.register("a");
    let b = registry.register("b");
    assert_ne!(a, b);
    assert_eq!(*registry.resolve(a), "a");
    assert_eq!(*registry.resolve(b), "b");
    assert_eq!(registry.len(), 2);
    assert_eq!(Handle::from_raw(a.into_raw()), Some(a));
    assert_eq!(Handle::from_raw(0), None);
}

#[test]
#[should_panic(expected = "contract violation: unknown handle")]
fn test_resolve_unknown_handle() {
    let registry = HandleRegistry::<()>::default();
    registry.resolve(Handle::new(3, 0));
}

#[test]
fn test_release_is_deferred_by_default() {
    let mut registry = HandleRegistry::default();
    let a = registry.register(1);
    assert_eq!(registry.release(a), None);
    assert_eq!(registry.get(a), Some(&1));
    assert_eq!(registry.len(), 1);

    registry.clear();
    assert_eq!(registry.get(a), None);
    assert!(registry.is_empty());
}

#[test]
fn test_stale_handle_after_slot_reuse() {
    let mut registry = HandleRegistry::new(ReleasePolicy::WhenUnreferenced);
    let a = registry.register("a");
    assert_eq!(registry.release(a), Some("a"));
    assert!(registry.is_empty());

    let b = registry.register("b");
    // same slot, new generation
    assert_eq!(a.index(), b.index());
    assert_eq!(registry.get(a), None);
    assert_eq!(registry.get(b), Some(&"b"));
}

#[test]
fn test_clear_invalidates_handles_for_good() {
    let mut registry = HandleRegistry::default();
    let a = registry.register("a");
    registry.clear();
    let b = registry.register("b");
    assert_eq!(registry.get(a), None);
    assert_eq!(registry.get(b), Some(&"b"));
}
