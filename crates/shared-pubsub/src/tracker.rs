//! # Subscription Identity Registry
//!
//! Maps subscription names to in-process handles and back.
//!
//! Handles are minted from 1 and index a slot table that only grows.
//! Releasing a handle empties its slot but never frees it for reuse, so a
//! stale handle always resolves to "not found" and never to a different
//! subscription.

use std::collections::HashMap;
use std::fmt;

/// In-process alias for a bus-side subscription.
///
/// Only meaningful on the tracker (and engine) instance that minted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    #[must_use]
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lookup key: either a handle or a full subscription name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKey<'a> {
    Handle(SubscriptionHandle),
    Name(&'a str),
}

impl From<SubscriptionHandle> for SubscriptionKey<'_> {
    fn from(handle: SubscriptionHandle) -> Self {
        Self::Handle(handle)
    }
}

impl<'a> From<&'a str> for SubscriptionKey<'a> {
    fn from(name: &'a str) -> Self {
        Self::Name(name)
    }
}

struct Slot<S> {
    name: String,
    subscription: S,
}

/// Registry of live subscriptions keyed by handle and by name.
pub struct SubscriptionTracker<S> {
    /// `slots[h - 1]` belongs to handle `h` forever.
    slots: Vec<Option<Slot<S>>>,
    /// Name → handle for live subscriptions only.
    by_name: HashMap<String, SubscriptionHandle>,
}

impl<S> SubscriptionTracker<S> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    /// Register `subscription` under `name` and mint its handle.
    ///
    /// If `name` was already live, the name now resolves to the new handle;
    /// the older handle keeps resolving to its own subscription until released.
    pub fn add(&mut self, name: impl Into<String>, subscription: S) -> SubscriptionHandle {
        let name = name.into();
        self.slots.push(Some(Slot {
            name: name.clone(),
            subscription,
        }));
        let handle = SubscriptionHandle(self.slots.len() as u64);
        self.by_name.insert(name, handle);
        handle
    }

    /// Look up a live subscription by handle or name.
    pub fn get<'a>(&self, key: impl Into<SubscriptionKey<'a>>) -> Option<&S> {
        let handle = self.resolve(key.into())?;
        self.slot(handle).map(|slot| &slot.subscription)
    }

    /// Mutable variant of [`Self::get`].
    pub fn get_mut<'a>(&mut self, key: impl Into<SubscriptionKey<'a>>) -> Option<&mut S> {
        let handle = self.resolve(key.into())?;
        let index = Self::index(handle)?;
        self.slots
            .get_mut(index)
            .and_then(Option::as_mut)
            .map(|slot| &mut slot.subscription)
    }

    /// Handle of the live subscription registered under `name`.
    #[must_use]
    pub fn get_handle(&self, name: &str) -> Option<SubscriptionHandle> {
        self.by_name.get(name).copied()
    }

    /// Name of the live subscription behind `handle`.
    #[must_use]
    pub fn name_of(&self, handle: SubscriptionHandle) -> Option<&str> {
        self.slot(handle).map(|slot| slot.name.as_str())
    }

    /// Tombstone `handle` and its name mapping.
    ///
    /// Returns the released subscription; releasing an unknown or already
    /// released handle is a no-op returning `None`.
    pub fn release(&mut self, handle: SubscriptionHandle) -> Option<S> {
        let index = Self::index(handle)?;
        let slot = self.slots.get_mut(index)?.take()?;
        if self.by_name.get(&slot.name) == Some(&handle) {
            self.by_name.remove(&slot.name);
        }
        Some(slot.subscription)
    }

    /// Number of live (unreleased) subscriptions.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Number of handles minted so far.
    #[must_use]
    pub fn minted(&self) -> u64 {
        self.slots.len() as u64
    }

    fn resolve(&self, key: SubscriptionKey<'_>) -> Option<SubscriptionHandle> {
        match key {
            SubscriptionKey::Handle(handle) => Some(handle),
            SubscriptionKey::Name(name) => self.get_handle(name),
        }
    }

    fn slot(&self, handle: SubscriptionHandle) -> Option<&Slot<S>> {
        self.slots.get(Self::index(handle)?)?.as_ref()
    }

    fn index(handle: SubscriptionHandle) -> Option<usize> {
        usize::try_from(handle.0).ok()?.checked_sub(1)
    }
}

impl<S> Default for SubscriptionTracker<S> {
    fn default() -> Self {
        Self::new()
    }
}
