//! Forward-input observers attached to quantizable layers
//!
//! A hook is installed through [`HookRegistry::register`] and stays active for as
//! long as the returned [`HookHandle`] lives. Dropping the handle uninstalls the
//! hook, so a capture that fails halfway never leaves an observer behind.

use ndarray::Array3;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Observer invoked with a layer's input right before the layer computes
pub trait ForwardHook: Send + Sync {
    fn on_input(&self, layer: &str, input: &Array3<f32>);
}

#[derive(Default)]
struct HookSlots {
    next_id: u64,
    hooks: Vec<(u64, Arc<dyn ForwardHook>)>,
}

/// Per-layer set of installed hooks
#[derive(Default)]
pub struct HookRegistry {
    slots: Mutex<HookSlots>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, hook: Arc<dyn ForwardHook>) -> HookHandle<'_> {
        let mut slots = self.slots.lock();
        let id = slots.next_id;
        slots.next_id += 1;
        slots.hooks.push((id, hook));
        HookHandle { registry: self, id }
    }

    /// Calls every installed hook with `input`
    pub fn dispatch(&self, layer: &str, input: &Array3<f32>) {
        let hooks: Vec<Arc<dyn ForwardHook>> = {
            let slots = self.slots.lock();
            if slots.hooks.is_empty() {
                return;
            }
            slots.hooks.iter().map(|(_, hook)| hook.clone()).collect()
        };
        for hook in hooks {
            hook.on_input(layer, input);
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, id: u64) {
        self.slots.lock().hooks.retain(|(hook_id, _)| *hook_id != id);
    }
}

/// Hooks belong to a live layer instance; a cloned layer starts clean.
impl Clone for HookRegistry {
    fn clone(&self) -> Self {
        Self::default()
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry").field("installed", &self.len()).finish()
    }
}

/// Keeps a hook installed; dropping it removes the hook.
pub struct HookHandle<'a> {
    registry: &'a HookRegistry,
    id: u64,
}

impl HookHandle<'_> {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for HookHandle<'_> {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        calls: AtomicUsize,
    }

    impl ForwardHook for Counter {
        fn on_input(&self, _layer: &str, _input: &Array3<f32>) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_hook_receives_inputs_while_installed() {
        let registry = HookRegistry::new();
        let counter = Arc::new(Counter::default());
        let input = Array3::<f32>::zeros((1, 2, 3));

        {
            let _handle = registry.register(counter.clone());
            assert_eq!(registry.len(), 1);
            registry.dispatch("dense", &input);
            registry.dispatch("dense", &input);
        }

        assert!(registry.is_empty());
        registry.dispatch("dense", &input);
        assert_eq!(counter.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_handle_removes_only_its_hook() {
        let registry = HookRegistry::new();
        let first = registry.register(Arc::new(Counter::default()));
        let second = registry.register(Arc::new(Counter::default()));
        assert_ne!(first.id(), second.id());
        drop(first);
        assert_eq!(registry.len(), 1);
        drop(second);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_hooks_removed_on_early_return() {
        fn failing_capture(registry: &HookRegistry) -> Result<(), String> {
            let _handle = registry.register(Arc::new(Counter::default()));
            Err("forward failed".to_string())
        }

        let registry = HookRegistry::new();
        assert!(failing_capture(&registry).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_clone_starts_without_hooks() {
        let registry = HookRegistry::new();
        let _handle = registry.register(Arc::new(Counter::default()));
        assert!(registry.clone().is_empty());
    }
}
