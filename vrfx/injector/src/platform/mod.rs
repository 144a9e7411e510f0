// Process-wide entry points of the injected library. Everything in here talks to the host process
// directly, the core modules only see owned values handed down from this layer.

mod imports;
mod nvapi;
mod oculus;
mod openvr;

use crate::{
    graphics::d3d11::{self, D3D11},
    hooks::*,
    logging_backend,
    postprocess::kernels::{KernelDirectory, KernelSource},
    runtimes::ExtensionLoader,
};
use lazy_static::lazy_static;
use log::*;
use parking_lot::Mutex;
use std::{
    ffi::{CStr, CString, OsString},
    os::windows::ffi::OsStringExt,
    path::{Path, PathBuf},
    ptr::null_mut,
    sync::Arc,
};
use nvapi::NvApiShadingRates;
use vrfx_common::{data::SettingsStore, *};
use winapi::{
    shared::minwindef::{BOOL, DWORD, FARPROC, HINSTANCE, HMODULE, LPVOID, TRUE},
    um::{
        libloaderapi::*,
        winnt::{DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH, HANDLE, LPCSTR, LPCWSTR},
    },
};

const TRACE_CONTEXT: &str = "Platform";

const LOG_FILE_NAME: &str = "vrfx.log";
const SETTINGS_FILE_NAME: &str = "vrfx.json";
const KERNELS_DIR_NAME: &str = "kernels";

const OPENVR_MODULE_NAME: &str = "vrclient_x64.dll";
const OCULUS_MODULE_NAME: &str = "LibOVRRT64_1.dll";

lazy_static! {
    pub static ref HOOKS: HookRegistry = HookRegistry::new();
    static ref CONTEXT: Mutex<Option<Arc<InjectorContext>>> = Mutex::new(None);
}

/// Host graphics objects are only touched from the thread that submits frames.
pub struct HostOwned<T>(pub T);
unsafe impl<T> Send for HostOwned<T> {}

pub struct InjectorContext {
    module: usize,
    pub settings: Arc<SettingsStore>,
    pub kernels: Arc<dyn KernelSource>,
}

pub fn context() -> Option<Arc<InjectorContext>> {
    CONTEXT.lock().clone()
}

pub fn nvapi_extension() -> ExtensionLoader<D3D11, NvApiShadingRates> {
    Box::new(|device| match NvApiShadingRates::load(device) {
        Ok(extension) => Some(extension),
        Err(e) => {
            info!("Variable rate shading is not available: {}", e);
            None
        }
    })
}

/// # Safety
/// `F` must match the signature of the exported function.
unsafe fn proc<F: FnPtr>(module: HMODULE, name: &str) -> StrResult<F> {
    let c_name = trace_err!(CString::new(name))?;
    let address = GetProcAddress(module, c_name.as_ptr());
    if address.is_null() {
        trace_str!("{} is not exported by the module", name)
    } else {
        Ok(F::from_addr(address as usize))
    }
}

/// Bind `detour` to a function the host is resolving by name. Returns the address to hand out.
pub fn resolve_detour<F: FnPtr>(name: &str, original: usize, detour: F) -> Option<usize> {
    if !HOOKS.install_resolved(name, original, detour) {
        // the runtime was reloaded at another address
        HOOKS.remove(detour);
        if !HOOKS.install_resolved(name, original, detour) {
            return None;
        }
    }
    Some(detour.addr())
}

fn module_path(module: HMODULE) -> PathBuf {
    let mut buffer = vec![0_u16; 4096];
    let length = unsafe { GetModuleFileNameW(module, buffer.as_mut_ptr(), buffer.len() as DWORD) };
    PathBuf::from(OsString::from_wide(&buffer[..length as usize]))
}

fn module_handle(name: &str) -> Option<HMODULE> {
    let wide_name = name.encode_utf16().chain(Some(0)).collect::<Vec<_>>();
    let mut handle = null_mut();
    let found = unsafe {
        GetModuleHandleExW(
            GET_MODULE_HANDLE_EX_FLAG_PIN,
            wide_name.as_ptr(),
            &mut handle,
        )
    };
    if found != 0 {
        Some(handle)
    } else {
        None
    }
}

type LoadLibraryAFn = unsafe extern "system" fn(LPCSTR) -> HMODULE;
type LoadLibraryWFn = unsafe extern "system" fn(LPCWSTR) -> HMODULE;
type LoadLibraryExAFn = unsafe extern "system" fn(LPCSTR, HANDLE, DWORD) -> HMODULE;
type LoadLibraryExWFn = unsafe extern "system" fn(LPCWSTR, HANDLE, DWORD) -> HMODULE;
type GetProcAddressFn = unsafe extern "system" fn(HMODULE, LPCSTR) -> FARPROC;

const DATA_ONLY_FLAGS: DWORD = LOAD_LIBRARY_AS_DATAFILE
    | LOAD_LIBRARY_AS_DATAFILE_EXCLUSIVE
    | LOAD_LIBRARY_AS_IMAGE_RESOURCE;

fn on_library_loaded(handle: HMODULE) {
    let guard = HookGuard::enter();
    if guard.already_inside() || handle.is_null() {
        return;
    }
    if let Some(context) = context() {
        if handle as usize != context.module {
            install_loader_hooks(context.module as HMODULE);
            detect_runtimes();
        }
    }
}

unsafe extern "system" fn load_library_a_detour(file_name: LPCSTR) -> HMODULE {
    let handle = match HOOKS.call_original(load_library_a_detour as LoadLibraryAFn) {
        Some(original) => original(file_name),
        None => return null_mut(),
    };
    on_library_loaded(handle);
    handle
}

unsafe extern "system" fn load_library_w_detour(file_name: LPCWSTR) -> HMODULE {
    let handle = match HOOKS.call_original(load_library_w_detour as LoadLibraryWFn) {
        Some(original) => original(file_name),
        None => return null_mut(),
    };
    on_library_loaded(handle);
    handle
}

unsafe extern "system" fn load_library_ex_a_detour(
    file_name: LPCSTR,
    file: HANDLE,
    flags: DWORD,
) -> HMODULE {
    let handle = match HOOKS.call_original(load_library_ex_a_detour as LoadLibraryExAFn) {
        Some(original) => original(file_name, file, flags),
        None => return null_mut(),
    };
    if flags & DATA_ONLY_FLAGS == 0 {
        on_library_loaded(handle);
    }
    handle
}

unsafe extern "system" fn load_library_ex_w_detour(
    file_name: LPCWSTR,
    file: HANDLE,
    flags: DWORD,
) -> HMODULE {
    let handle = match HOOKS.call_original(load_library_ex_w_detour as LoadLibraryExWFn) {
        Some(original) => original(file_name, file, flags),
        None => return null_mut(),
    };
    if flags & DATA_ONLY_FLAGS == 0 {
        on_library_loaded(handle);
    }
    handle
}

unsafe extern "system" fn get_proc_address_detour(module: HMODULE, name: LPCSTR) -> FARPROC {
    let address = match HOOKS.call_original(get_proc_address_detour as GetProcAddressFn) {
        Some(original) => original(module, name),
        None => return null_mut(),
    };

    let guard = HookGuard::enter();
    // the high word of an ordinal lookup is zero
    if guard.already_inside() || address.is_null() || (name as usize) >> 16 == 0 {
        return address;
    }

    let name = match CStr::from_ptr(name).to_str() {
        Ok(name) => name,
        Err(_) => return address,
    };
    let detour = openvr::resolve(name, address as usize)
        .or_else(|| oculus::resolve(name, address as usize));
    match detour {
        Some(detour) => {
            info!("Redirecting {}", name);
            detour as FARPROC
        }
        None => address,
    }
}

// Patch the import tables of every module but ours. Sites already redirected are left alone.
fn install_loader_hooks(own_module: HMODULE) {
    fn install_imports<F: FnPtr>(modules: &[HMODULE], name: &str, detour: F) {
        for &module in modules {
            for slot in unsafe { imports::import_slots(module, name) } {
                unsafe { HOOKS.install(name, slot, detour) };
            }
        }
    }

    let modules = imports::loaded_modules()
        .into_iter()
        .filter(|&module| module != own_module)
        .collect::<Vec<_>>();

    install_imports(&modules, "LoadLibraryA", load_library_a_detour as LoadLibraryAFn);
    install_imports(&modules, "LoadLibraryW", load_library_w_detour as LoadLibraryWFn);
    install_imports(&modules, "LoadLibraryExA", load_library_ex_a_detour as LoadLibraryExAFn);
    install_imports(&modules, "LoadLibraryExW", load_library_ex_w_detour as LoadLibraryExWFn);
    install_imports(&modules, "GetProcAddress", get_proc_address_detour as GetProcAddressFn);
}

fn detect_runtimes() {
    if let Some(handle) = module_handle(OPENVR_MODULE_NAME) {
        openvr::on_runtime_loaded(handle);
    }
    if let Some(handle) = module_handle(OCULUS_MODULE_NAME) {
        oculus::on_runtime_loaded(handle);
    }
}

fn attach(module: HMODULE) {
    let own_path = module_path(module);
    let base_dir = own_path.parent().map(Path::to_owned).unwrap_or_default();

    logging_backend::init_logging(&base_dir.join(LOG_FILE_NAME));
    info!("VRFX {} loaded from {}", env!("CARGO_PKG_VERSION"), own_path.display());
    info!("Host executable: {}", module_path(null_mut()).display());

    let settings = Arc::new(SettingsStore::load(&base_dir.join(SETTINGS_FILE_NAME)));
    let kernels = Arc::new(KernelDirectory::load(&base_dir.join(KERNELS_DIR_NAME)));
    *CONTEXT.lock() = Some(Arc::new(InjectorContext {
        module: module as usize,
        settings,
        kernels,
    }));

    install_loader_hooks(module);
    detect_runtimes();
}

fn detach() {
    info!("Shutting down");
    oculus::shutdown();
    openvr::shutdown();
    d3d11::remove_context_hooks();
    HOOKS.remove_all();
    CONTEXT.lock().take();
    log::logger().flush();
}

#[no_mangle]
pub extern "system" fn DllMain(module: HINSTANCE, reason: DWORD, _: LPVOID) -> BOOL {
    match reason {
        DLL_PROCESS_ATTACH => attach(module),
        DLL_PROCESS_DETACH => detach(),
        _ => (),
    }
    TRUE
}
