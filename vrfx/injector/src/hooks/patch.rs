use std::{os::raw::c_void, ptr};
use vrfx_common::*;

#[cfg(windows)]
const TRACE_CONTEXT: &str = "Patch";

/// Address of entry `index` in the virtual table of a live COM-like object. Every object sharing
/// the same concrete class shares this slot.
pub unsafe fn vtable_slot_address(instance: *mut c_void, index: usize) -> Option<*mut usize> {
    if instance.is_null() {
        return None;
    }

    let vtable = *(instance as *const *mut usize);
    if vtable.is_null() {
        None
    } else {
        Some(vtable.add(index))
    }
}

pub unsafe fn read_slot(slot: *const usize) -> usize {
    ptr::read_volatile(slot)
}

#[cfg(windows)]
pub unsafe fn write_slot(slot: *mut usize, value: usize) -> StrResult {
    use std::mem::size_of;
    use winapi::um::{errhandlingapi::GetLastError, memoryapi::VirtualProtect, winnt::*};

    let mut old_protection = 0;
    if VirtualProtect(
        slot as _,
        size_of::<usize>(),
        PAGE_READWRITE,
        &mut old_protection,
    ) == 0
    {
        return trace_str!("VirtualProtect failed with code {}", GetLastError());
    }

    ptr::write_volatile(slot, value);

    VirtualProtect(
        slot as _,
        size_of::<usize>(),
        old_protection,
        &mut old_protection,
    );

    Ok(())
}

#[cfg(not(windows))]
pub unsafe fn write_slot(slot: *mut usize, value: usize) -> StrResult {
    ptr::write_volatile(slot, value);
    Ok(())
}
