mod patch;

pub use patch::*;

use log::*;
use parking_lot::Mutex;
use std::{cell::Cell, collections::HashMap, mem, os::raw::c_void};

/// A function pointer type that can be stored as a plain address.
pub trait FnPtr: Copy {
    fn addr(self) -> usize;

    /// # Safety
    /// `addr` must point to a function with exactly this signature.
    unsafe fn from_addr(addr: usize) -> Self;
}

macro_rules! impl_fn_ptr {
    ($($arg:ident),*) => {
        impl<R, $($arg),*> FnPtr for unsafe extern "system" fn($($arg),*) -> R {
            fn addr(self) -> usize {
                self as usize
            }

            unsafe fn from_addr(addr: usize) -> Self {
                mem::transmute_copy(&addr)
            }
        }
    };
}

impl_fn_ptr!();
impl_fn_ptr!(A);
impl_fn_ptr!(A, B);
impl_fn_ptr!(A, B, C);
impl_fn_ptr!(A, B, C, D);
impl_fn_ptr!(A, B, C, D, E);
impl_fn_ptr!(A, B, C, D, E, F);
impl_fn_ptr!(A, B, C, D, E, F, G);
impl_fn_ptr!(A, B, C, D, E, F, G, H);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct PatchSite {
    slot: usize,
    previous: usize,
}

// Sites of the same detour can hold different previous values (for example import table entries
// bound to a forwarder in one module and to the implementation in another).
struct RedirectEntry {
    name: String,
    original: usize,
    sites: Vec<PatchSite>,
}

/// Bookkeeping of every active redirection, keyed by detour address.
#[derive(Default)]
pub struct HookRegistry {
    entries: Mutex<HashMap<usize, RedirectEntry>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Redirect the function pointer stored in `slot` to `detour`. Returns true if the detour is
    /// active on the slot after the call.
    ///
    /// # Safety
    /// `slot` must be a valid, pointer-aligned cell holding a function of the same signature as
    /// `detour`.
    pub unsafe fn install<F: FnPtr>(&self, name: &str, slot: *mut usize, detour: F) -> bool {
        if slot.is_null() {
            error!("Cannot hook {}: null slot", name);
            return false;
        }

        let detour_addr = detour.addr();
        let mut entries = self.entries.lock();

        let current = read_slot(slot);
        if current == detour_addr {
            let owned = entries
                .get(&detour_addr)
                .map(|entry| entry.sites.iter().any(|site| site.slot == slot as usize))
                .unwrap_or(false);
            if !owned {
                warn!("{} is already redirected by someone else", name);
            }
            return owned;
        }
        if current == 0 {
            error!("Cannot hook {}: empty slot", name);
            return false;
        }
        if let Some(other) = entries.get(&current) {
            warn!(
                "Cannot hook {}: slot already redirected to {}",
                name, other.name
            );
            return false;
        }

        if let Err(e) = write_slot(slot, detour_addr) {
            error!("Cannot hook {}: {}", name, e);
            return false;
        }

        let entry = entries
            .entry(detour_addr)
            .or_insert_with(|| RedirectEntry {
                name: name.to_owned(),
                original: current,
                sites: vec![],
            });
        entry.sites.push(PatchSite {
            slot: slot as usize,
            previous: current,
        });

        debug!("Hooked {} ({} sites)", name, entry.sites.len());
        true
    }

    /// Redirect method `index` of the virtual table of `instance`.
    ///
    /// # Safety
    /// `instance` must be a live object whose virtual table has more than `index` entries.
    pub unsafe fn install_virtual<F: FnPtr>(
        &self,
        name: &str,
        instance: *mut c_void,
        index: usize,
        detour: F,
    ) -> bool {
        match vtable_slot_address(instance, index) {
            Some(slot) => self.install(name, slot, detour),
            None => {
                error!("Cannot hook {}: null instance or virtual table", name);
                false
            }
        }
    }

    /// Record a redirection that is realized by handing out `detour` whenever the host resolves
    /// `original` by name. No memory is patched.
    pub fn install_resolved<F: FnPtr>(&self, name: &str, original: usize, detour: F) -> bool {
        if original == 0 {
            error!("Cannot hook {}: null target", name);
            return false;
        }

        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(&detour.addr()) {
            if entry.original != original {
                warn!("Cannot hook {}: detour already bound to another target", name);
            }
            return entry.original == original;
        }

        entries.insert(
            detour.addr(),
            RedirectEntry {
                name: name.to_owned(),
                original,
                sites: vec![],
            },
        );
        debug!("Hooked {} at resolution time", name);
        true
    }

    pub fn is_installed<F: FnPtr>(&self, detour: F) -> bool {
        self.entries.lock().contains_key(&detour.addr())
    }

    /// Implementation that was in place before `detour` was installed. Asking for a detour that
    /// was never installed is a bug.
    pub fn call_original<F: FnPtr>(&self, detour: F) -> Option<F> {
        let original = self
            .entries
            .lock()
            .get(&detour.addr())
            .map(|entry| entry.original);
        debug_assert!(original.is_some(), "No redirection registered for this detour");

        original.map(|addr| unsafe { F::from_addr(addr) })
    }

    pub fn remove<F: FnPtr>(&self, detour: F) {
        let entry = self.entries.lock().remove(&detour.addr());
        if let Some(entry) = entry {
            unsafe { restore_sites(&entry, detour.addr()) };
        }
    }

    pub fn remove_all(&self) {
        let entries = self.entries.lock().drain().collect::<Vec<_>>();
        for (detour_addr, entry) in entries {
            unsafe { restore_sites(&entry, detour_addr) };
        }
    }
}

unsafe fn restore_sites(entry: &RedirectEntry, detour_addr: usize) {
    for site in entry.sites.iter().rev() {
        let slot = site.slot as *mut usize;
        if read_slot(slot) != detour_addr {
            warn!("{} was overwritten after hooking, leaving it untouched", entry.name);
            continue;
        }
        if let Err(e) = write_slot(slot, site.previous) {
            error!("Failed to unhook {}: {}", entry.name, e);
        }
    }
    debug!("Unhooked {}", entry.name);
}

thread_local! {
    static INSIDE_DETOUR: Cell<bool> = Cell::new(false);
}

/// Scoped marker for "this thread is executing one of our detours". Detours that find it already
/// set must forward straight to the original implementation: the call was made by the injector
/// itself.
pub struct HookGuard {
    was_inside: bool,
}

impl HookGuard {
    pub fn enter() -> Self {
        Self {
            was_inside: INSIDE_DETOUR.with(|inside| inside.replace(true)),
        }
    }

    pub fn already_inside(&self) -> bool {
        self.was_inside
    }
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        INSIDE_DETOUR.with(|inside| inside.set(self.was_inside));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type UnaryFn = unsafe extern "system" fn(u32) -> u32;

    unsafe extern "system" fn add_one(value: u32) -> u32 {
        value + 1
    }

    unsafe extern "system" fn add_two(value: u32) -> u32 {
        value + 2
    }

    unsafe extern "system" fn double(value: u32) -> u32 {
        value * 2
    }

    unsafe extern "system" fn triple(value: u32) -> u32 {
        value * 3
    }

    // Heap stand-in for a COM object: the first word of the instance points to the vtable.
    struct FakeObject {
        vtable: Box<[usize; 4]>,
        instance: Box<*mut usize>,
    }

    impl FakeObject {
        fn new() -> Self {
            let mut vtable = Box::new([add_one as UnaryFn as usize; 4]);
            vtable[1] = add_two as UnaryFn as usize;
            let instance = Box::new(vtable.as_mut_ptr());
            Self { vtable, instance }
        }

        fn instance(&mut self) -> *mut c_void {
            &mut *self.instance as *mut *mut usize as _
        }

        fn call(&self, index: usize, value: u32) -> u32 {
            unsafe { <UnaryFn as FnPtr>::from_addr(self.vtable[index])(value) }
        }
    }

    #[test]
    fn install_and_remove_virtual() {
        let registry = HookRegistry::new();
        let mut object = FakeObject::new();
        let instance = object.instance();

        assert!(unsafe { registry.install_virtual("slot 1", instance, 1, double as UnaryFn) });
        assert_eq!(object.call(1, 5), 10);
        assert_eq!(object.call(0, 5), 6);

        let original = registry.call_original(double as UnaryFn).unwrap();
        assert_eq!(unsafe { original(5) }, 7);

        registry.remove(double as UnaryFn);
        assert_eq!(object.call(1, 5), 7);
        assert!(!registry.is_installed(double as UnaryFn));

        // removing an unknown detour is a no-op
        registry.remove(double as UnaryFn);
        assert_eq!(object.call(1, 5), 7);
    }

    #[test]
    fn reinstall_is_idempotent() {
        let registry = HookRegistry::new();
        let mut object = FakeObject::new();
        let instance = object.instance();

        unsafe {
            assert!(registry.install_virtual("slot 0", instance, 0, triple as UnaryFn));
            assert!(registry.install_virtual("slot 0", instance, 0, triple as UnaryFn));
        }
        assert_eq!(object.call(0, 2), 6);

        registry.remove(triple as UnaryFn);
        assert_eq!(object.call(0, 2), 3);
    }

    #[test]
    fn conflicting_detour_is_ignored() {
        let registry = HookRegistry::new();
        let mut object = FakeObject::new();
        let instance = object.instance();

        unsafe {
            assert!(registry.install_virtual("first", instance, 2, double as UnaryFn));
            assert!(!registry.install_virtual("second", instance, 2, triple as UnaryFn));
        }
        assert_eq!(object.call(2, 4), 8);
        assert!(!registry.is_installed(triple as UnaryFn));

        registry.remove_all();
        assert_eq!(object.call(2, 4), 5);
    }

    #[test]
    fn one_detour_many_sites() {
        let registry = HookRegistry::new();
        let mut first = FakeObject::new();
        let mut second = FakeObject::new();
        let (first_instance, second_instance) = (first.instance(), second.instance());

        unsafe {
            assert!(registry.install_virtual("shared", first_instance, 3, double as UnaryFn));
            assert!(registry.install_virtual("shared", second_instance, 3, double as UnaryFn));
        }
        assert_eq!(first.call(3, 3), 6);
        assert_eq!(second.call(3, 3), 6);

        registry.remove(double as UnaryFn);
        assert_eq!(first.call(3, 3), 4);
        assert_eq!(second.call(3, 3), 4);
    }

    #[test]
    fn resolved_redirection() {
        let registry = HookRegistry::new();
        let original = add_two as UnaryFn as usize;

        assert!(registry.install_resolved("resolved", original, double as UnaryFn));
        assert!(registry.install_resolved("resolved", original, double as UnaryFn));
        assert!(!registry.install_resolved("resolved", add_one as UnaryFn as usize, double as UnaryFn));

        let original_fn = registry.call_original(double as UnaryFn).unwrap();
        assert_eq!(unsafe { original_fn(1) }, 3);
    }

    #[test]
    fn independent_registries() {
        let first = HookRegistry::new();
        let second = HookRegistry::new();

        assert!(first.install_resolved("a", add_one as UnaryFn as usize, double as UnaryFn));
        assert!(!second.is_installed(double as UnaryFn));
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic]
    fn call_original_without_install_panics_in_debug() {
        HookRegistry::new().call_original(triple as UnaryFn);
    }

    #[test]
    fn guard_nesting() {
        let outer = HookGuard::enter();
        assert!(!outer.already_inside());
        {
            let inner = HookGuard::enter();
            assert!(inner.already_inside());
        }
        assert!(HookGuard::enter().already_inside());
        drop(outer);
        assert!(!HookGuard::enter().already_inside());
    }
}
