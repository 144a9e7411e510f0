use std::{ffi::CStr, mem::size_of, ptr::null_mut};
use winapi::{
    shared::minwindef::{DWORD, HMODULE},
    um::{processthreadsapi::GetCurrentProcess, psapi::EnumProcessModules, winnt::*},
};

/// Every module currently loaded in the process.
pub fn loaded_modules() -> Vec<HMODULE> {
    let mut modules = vec![null_mut(); 1024];
    loop {
        let mut needed: DWORD = 0;
        let ok = unsafe {
            EnumProcessModules(
                GetCurrentProcess(),
                modules.as_mut_ptr(),
                (modules.len() * size_of::<HMODULE>()) as DWORD,
                &mut needed,
            )
        };
        if ok == 0 {
            return vec![];
        }

        let count = needed as usize / size_of::<HMODULE>();
        if count <= modules.len() {
            modules.truncate(count);
            return modules;
        }
        modules.resize(count, null_mut());
    }
}

/// Import address table entries of `module` that hold the function imported by name `function`,
/// whatever library it is imported from.
///
/// # Safety
/// `module` must be the base address of a mapped PE image.
pub unsafe fn import_slots(module: HMODULE, function: &str) -> Vec<*mut usize> {
    let base = module as usize;
    let dos_header = &*(base as *const IMAGE_DOS_HEADER);
    if dos_header.e_magic != IMAGE_DOS_SIGNATURE {
        return vec![];
    }
    let nt_headers = &*((base + dos_header.e_lfanew as usize) as *const IMAGE_NT_HEADERS64);
    if nt_headers.Signature != IMAGE_NT_SIGNATURE {
        return vec![];
    }

    let directory =
        &nt_headers.OptionalHeader.DataDirectory[IMAGE_DIRECTORY_ENTRY_IMPORT as usize];
    if directory.VirtualAddress == 0 || directory.Size == 0 {
        return vec![];
    }

    let mut slots = vec![];
    let mut descriptor = (base + directory.VirtualAddress as usize) as *const IMAGE_IMPORT_DESCRIPTOR;
    while (*descriptor).Name != 0 {
        let names_rva = *(*descriptor).u.OriginalFirstThunk();
        // bound imports without a name table cannot be matched by name
        if names_rva != 0 {
            let mut name_thunk = (base + names_rva as usize) as *const u64;
            let mut address_thunk = (base + (*descriptor).FirstThunk as usize) as *mut usize;

            while *name_thunk != 0 {
                if *name_thunk & IMAGE_ORDINAL_FLAG64 == 0 {
                    // IMAGE_IMPORT_BY_NAME: 2 bytes of hint, then the name
                    let name = CStr::from_ptr((base + *name_thunk as usize + 2) as *const _);
                    if name.to_bytes() == function.as_bytes() {
                        slots.push(address_thunk);
                    }
                }
                name_thunk = name_thunk.add(1);
                address_thunk = address_thunk.add(1);
            }
        }
        descriptor = descriptor.add(1);
    }

    slots
}
