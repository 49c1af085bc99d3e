//! Typed, id-addressable callback registry (C9).
//!
//! Every upper layer (broker, scheme, HTTP/2 session, cluster) wires its
//! events through one of these containers rather than holding `Box<dyn Fn>`
//! fields directly, so a single `on`/`set`/`erase`/`call` vocabulary covers
//! read/write/close/connect handlers, HTTP/2 frame callbacks, and cluster
//! IPC events alike.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// Event raised to the container's observer whenever a slot is mutated or
/// invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverEvent {
    Set,
    Del,
    Run,
}

/// Computes the 64-bit id a name is addressed by. Names of 8 bytes or
/// fewer are packed as their raw little-endian bytes; longer names are
/// hashed with a simple FNV-1a, which is more than adequate for a
/// process-local registry key and avoids pulling in a hashing crate
/// purely for this.
pub fn name_to_id(name: &str) -> u64 {
    let bytes = name.as_bytes();
    if bytes.len() <= 8 {
        let mut buf = [0u8; 8];
        buf[..bytes.len()].copy_from_slice(bytes);
        return u64::from_le_bytes(buf);
    }
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;
    let mut hash = FNV_OFFSET;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

type CallArg = Arc<dyn Any + Send + Sync>;
type BoxedFn = Arc<dyn Fn(&[CallArg]) -> CallArg + Send + Sync>;
type Observer = Arc<dyn Fn(ObserverEvent, u64) + Send + Sync>;

struct Slot {
    func: BoxedFn,
    bound: Vec<CallArg>,
}

/// A name/id -> type-erased function registry.
///
/// `set`/`get`/`erase`/`swap`/`call`/`on` all operate on `u64` ids; the
/// string-keyed variants are thin wrappers around [`name_to_id`].
#[derive(Default)]
pub struct CallbackContainer {
    slots: RwLock<HashMap<u64, Slot>>,
    observer: RwLock<Option<Observer>>,
}

impl CallbackContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the single observer that receives every `SET/DEL/RUN`
    /// notification. Only one observer slot is supported at a time.
    pub fn on_event(&self, observer: impl Fn(ObserverEvent, u64) + Send + Sync + 'static) {
        *self.observer.write() = Some(Arc::new(observer));
    }

    fn notify(&self, event: ObserverEvent, id: u64) {
        if let Some(obs) = self.observer.read().as_ref() {
            obs(event, id);
        }
    }

    /// Binds a handler under `id` with no partial application.
    pub fn set(&self, id: u64, func: impl Fn(&[CallArg]) -> CallArg + Send + Sync + 'static) {
        self.slots.write().insert(
            id,
            Slot {
                func: Arc::new(func),
                bound: Vec::new(),
            },
        );
        self.notify(ObserverEvent::Set, id);
    }

    /// Binds a handler by name, storing a partial application over
    /// `bound_args`: the bound arguments are prepended at every `call`.
    pub fn on<const N: usize>(
        &self,
        name: &str,
        func: impl Fn(&[CallArg]) -> CallArg + Send + Sync + 'static,
        bound_args: [CallArg; N],
    ) {
        let id = name_to_id(name);
        self.slots.write().insert(
            id,
            Slot {
                func: Arc::new(func),
                bound: bound_args.into(),
            },
        );
        self.notify(ObserverEvent::Set, id);
    }

    pub fn get_by_name_exists(&self, name: &str) -> bool {
        self.slots.read().contains_key(&name_to_id(name))
    }

    pub fn exists(&self, id: u64) -> bool {
        self.slots.read().contains_key(&id)
    }

    pub fn erase(&self, id: u64) -> bool {
        let removed = self.slots.write().remove(&id).is_some();
        if removed {
            self.notify(ObserverEvent::Del, id);
        }
        removed
    }

    pub fn erase_by_name(&self, name: &str) -> bool {
        self.erase(name_to_id(name))
    }

    /// Swaps the handlers registered under `a` and `b`, if both exist.
    pub fn swap(&self, a: u64, b: u64) {
        let mut slots = self.slots.write();
        if slots.contains_key(&a) && slots.contains_key(&b) {
            let sa = slots.remove(&a).unwrap();
            let sb = slots.remove(&b).unwrap();
            slots.insert(a, sb);
            slots.insert(b, sa);
        }
    }

    /// Invokes the handler registered under `id`, prepending any bound
    /// arguments before `args`. Returns `None` if nothing is registered.
    pub fn call(&self, id: u64, args: &[CallArg]) -> Option<CallArg> {
        let (func, bound) = {
            let slots = self.slots.read();
            let slot = slots.get(&id)?;
            (slot.func.clone(), slot.bound.clone())
        };
        let result = if bound.is_empty() {
            func(args)
        } else {
            let mut combined = bound;
            combined.extend_from_slice(args);
            func(&combined)
        };
        self.notify(ObserverEvent::Run, id);
        Some(result)
    }

    pub fn call_by_name(&self, name: &str, args: &[CallArg]) -> Option<CallArg> {
        self.call(name_to_id(name), args)
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn name_to_id_packs_short_names_verbatim() {
        let id = name_to_id("read");
        let mut expected = [0u8; 8];
        expected[..4].copy_from_slice(b"read");
        assert_eq!(id, u64::from_le_bytes(expected));
    }

    #[test]
    fn set_get_call_erase_round_trip() {
        let container = CallbackContainer::new();
        container.set(1, |_args| Arc::new(42i32) as CallArg);
        assert!(container.exists(1));

        let result = container.call(1, &[]).unwrap();
        assert_eq!(*result.downcast::<i32>().unwrap(), 42);

        assert!(container.erase(1));
        assert!(!container.exists(1));
        assert!(container.call(1, &[]).is_none());
    }

    #[test]
    fn observer_sees_set_del_run_in_order() {
        let container = CallbackContainer::new();
        let log: Arc<parking_lot::Mutex<Vec<ObserverEvent>>> = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let log2 = log.clone();
        container.on_event(move |event, _id| log2.lock().push(event));

        container.set(9, |_| Arc::new(()) as CallArg);
        container.call(9, &[]);
        container.erase(9);

        let seen = log.lock().clone();
        assert_eq!(seen, vec![ObserverEvent::Set, ObserverEvent::Run, ObserverEvent::Del]);
    }

    #[test]
    fn swap_exchanges_two_slots() {
        let container = CallbackContainer::new();
        let counter_a = Arc::new(AtomicUsize::new(0));
        let counter_b = Arc::new(AtomicUsize::new(0));
        let ca = counter_a.clone();
        container.set(1, move |_| {
            ca.fetch_add(1, Ordering::SeqCst);
            Arc::new(()) as CallArg
        });
        let cb = counter_b.clone();
        container.set(2, move |_| {
            cb.fetch_add(10, Ordering::SeqCst);
            Arc::new(()) as CallArg
        });

        container.swap(1, 2);
        container.call(1, &[]);
        assert_eq!(counter_b.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn bound_args_are_prepended_before_call_args() {
        let container = CallbackContainer::new();
        let seen: Arc<parking_lot::Mutex<Vec<i32>>> = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        container.on(
            "addup",
            move |args: &[CallArg]| {
                let total: i32 = args.iter().map(|a| *a.downcast_ref::<i32>().unwrap()).sum();
                seen2.lock().push(total);
                Arc::new(total) as CallArg
            },
            [Arc::new(10i32) as CallArg, Arc::new(20i32) as CallArg],
        );

        let result = container
            .call_by_name("addup", &[Arc::new(5i32) as CallArg])
            .unwrap();
        assert_eq!(*result.downcast::<i32>().unwrap(), 35);
        assert_eq!(seen.lock().clone(), vec![35]);
    }
}
