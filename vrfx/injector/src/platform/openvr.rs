use super::*;
use crate::{
    graphics::Backend,
    runtimes::{openvr::*, RawProjection},
};
use std::{
    os::raw::{c_char, c_void},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};
use vrfx_common::data::Eye;

// EVRCompositorError::RequestFailed
const COMPOSITOR_ERROR_REQUEST_FAILED: i32 = 1;

// Interface version queried when the host never asked for one itself.
const FALLBACK_SYSTEM_INTERFACE: &[u8] = b"IVRSystem_019\0";

type ClientCoreFactoryFn = unsafe extern "system" fn(*const c_char, *mut i32) -> *mut c_void;
type GetGenericInterfaceFn =
    unsafe extern "system" fn(*mut c_void, *const c_char, *mut i32) -> *mut c_void;
type CleanupFn = unsafe extern "system" fn(*mut c_void);
type SubmitFn = unsafe extern "system" fn(
    *mut c_void,
    i32,
    *const Texture,
    *const TextureBounds,
    u32,
) -> i32;

type Manager = OpenVrManager<D3D11, NvApiShadingRates>;

lazy_static! {
    static ref MANAGER: Mutex<Option<HostOwned<Manager>>> = Mutex::new(None);
}

static RUNTIME_DETECTED: AtomicBool = AtomicBool::new(false);
static CLIENT_CORE: AtomicUsize = AtomicUsize::new(0);
static SYSTEM: AtomicUsize = AtomicUsize::new(0);

/// IVRSystem accessed through its virtual table.
struct NativeVrSystem(*mut c_void);

impl NativeVrSystem {
    unsafe fn method<F: FnPtr>(&self, slot: usize) -> Option<F> {
        let slot = vtable_slot_address(self.0, slot)?;
        match read_slot(slot) {
            0 => None,
            address => Some(F::from_addr(address)),
        }
    }
}

impl VrSystem for NativeVrSystem {
    fn projection_raw(&self, eye: Eye) -> RawProjection {
        type GetProjectionRawFn =
            unsafe extern "system" fn(*mut c_void, i32, *mut f32, *mut f32, *mut f32, *mut f32);

        let mut projection = RawProjection {
            left: -1.,
            right: 1.,
            top: -1.,
            bottom: 1.,
        };
        unsafe {
            if let Some(get_projection_raw) = self.method::<GetProjectionRawFn>(2) {
                get_projection_raw(
                    self.0,
                    eye.index() as _,
                    &mut projection.left,
                    &mut projection.right,
                    &mut projection.top,
                    &mut projection.bottom,
                );
            }
        }
        projection
    }

    fn eye_to_head_transform(&self, eye: Eye) -> HmdMatrix34 {
        // member functions return structures through a hidden pointer that follows `this`
        type GetEyeToHeadTransformFn =
            unsafe extern "system" fn(*mut c_void, *mut HmdMatrix34, i32) -> *mut HmdMatrix34;

        let mut transform = HmdMatrix34 {
            m: [[1., 0., 0., 0.], [0., 1., 0., 0.], [0., 0., 1., 0.]],
        };
        unsafe {
            if let Some(get_transform) = self.method::<GetEyeToHeadTransformFn>(4) {
                get_transform(self.0, &mut transform, eye.index() as _);
            }
        }
        transform
    }

    fn recommended_render_target_size(&self) -> (u32, u32) {
        type GetRecommendedSizeFn = unsafe extern "system" fn(*mut c_void, *mut u32, *mut u32);

        let (mut width, mut height) = (0, 0);
        unsafe {
            if let Some(get_size) = self.method::<GetRecommendedSizeFn>(0) {
                get_size(self.0, &mut width, &mut height);
            }
        }
        (width, height)
    }
}

fn system() -> Option<NativeVrSystem> {
    let system = SYSTEM.load(Ordering::SeqCst);
    if system != 0 {
        return Some(NativeVrSystem(system as _));
    }

    let client_core = CLIENT_CORE.load(Ordering::SeqCst);
    let detour = get_generic_interface_detour as GetGenericInterfaceFn;
    if client_core == 0 || !HOOKS.is_installed(detour) {
        return None;
    }

    let get_generic_interface = HOOKS.call_original(detour)?;
    let mut error = 0;
    let instance = unsafe {
        get_generic_interface(
            client_core as _,
            FALLBACK_SYSTEM_INTERFACE.as_ptr() as _,
            &mut error,
        )
    };
    if instance.is_null() {
        warn!("Cannot query the OpenVR system interface (error {})", error);
        return None;
    }

    SYSTEM.store(instance as usize, Ordering::SeqCst);
    Some(NativeVrSystem(instance))
}

unsafe fn hook_interface(name: *const c_char, instance: *mut c_void) {
    if name.is_null() {
        return;
    }
    let name = CStr::from_ptr(name).to_string_lossy();
    info!("OpenVR: requested interface {}", name);
    if instance.is_null() {
        return;
    }

    let interface = parse_interface_name(&name);
    match interface {
        OpenVrInterface::ClientCore(_) => {
            HOOKS.remove(cleanup_detour as CleanupFn);
            HOOKS.remove(get_generic_interface_detour as GetGenericInterfaceFn);
            CLIENT_CORE.store(instance as usize, Ordering::SeqCst);
        }
        OpenVrInterface::Compositor(_) => HOOKS.remove(submit_detour as SubmitFn),
        OpenVrInterface::System(_) => SYSTEM.store(instance as usize, Ordering::SeqCst),
        OpenVrInterface::Other => (),
    }

    for hook in hook_plan(interface) {
        let installed = match hook.method {
            OpenVrMethod::GetGenericInterface => HOOKS.install_virtual(
                hook.name,
                instance,
                hook.slot,
                get_generic_interface_detour as GetGenericInterfaceFn,
            ),
            OpenVrMethod::Cleanup => {
                HOOKS.install_virtual(hook.name, instance, hook.slot, cleanup_detour as CleanupFn)
            }
            OpenVrMethod::Submit => {
                HOOKS.install_virtual(hook.name, instance, hook.slot, submit_detour as SubmitFn)
            }
        };
        if installed {
            info!("Installed hook for {}", hook.name);
        } else {
            error!("Failed to install hook for {}", hook.name);
        }
    }
}

unsafe extern "system" fn client_core_factory_detour(
    interface_name: *const c_char,
    return_code: *mut i32,
) -> *mut c_void {
    let instance = match HOOKS.call_original(client_core_factory_detour as ClientCoreFactoryFn) {
        Some(original) => original(interface_name, return_code),
        None => return null_mut(),
    };

    let guard = HookGuard::enter();
    if !guard.already_inside() {
        hook_interface(interface_name, instance);
    }
    instance
}

unsafe extern "system" fn get_generic_interface_detour(
    client_core: *mut c_void,
    interface_name: *const c_char,
    error: *mut i32,
) -> *mut c_void {
    let instance = match HOOKS.call_original(get_generic_interface_detour as GetGenericInterfaceFn)
    {
        Some(original) => original(client_core, interface_name, error),
        None => return null_mut(),
    };

    let guard = HookGuard::enter();
    if !guard.already_inside() {
        hook_interface(interface_name, instance);
    }
    instance
}

unsafe extern "system" fn cleanup_detour(client_core: *mut c_void) {
    if let Some(original) = HOOKS.call_original(cleanup_detour as CleanupFn) {
        original(client_core);
    }

    info!("IVRClientCore::Cleanup was called, deleting hooks...");
    shutdown();
    HOOKS.remove(get_generic_interface_detour as GetGenericInterfaceFn);
    HOOKS.remove(cleanup_detour as CleanupFn);
    HOOKS.remove(submit_detour as SubmitFn);
}

unsafe fn process_submit(
    eye: i32,
    submitted: &SubmittedTexture,
    bounds: *const TextureBounds,
) -> Option<SubmitOverride<D3D11>> {
    let texture = submitted.texture();
    if texture.texture_type != TEXTURE_TYPE_DIRECTX {
        return None;
    }

    let request = SubmitRequest {
        eye: if eye == 1 { Eye::Right } else { Eye::Left },
        texture: D3D11::texture_from_raw(texture.handle)?,
        bounds: bounds.as_ref().copied().unwrap_or_default(),
        color_space: texture.color_space,
    };

    let context = context()?;
    let system = system();
    let mut manager = MANAGER.lock();
    let manager = manager.get_or_insert_with(|| {
        HostOwned(OpenVrManager::new(
            context.settings.clone(),
            context.kernels.clone(),
            nvapi_extension(),
        ))
    });
    manager
        .0
        .on_submit(&request, system.as_ref().map(|s| s as &dyn VrSystem))
}

unsafe extern "system" fn submit_detour(
    compositor: *mut c_void,
    eye: i32,
    texture: *const Texture,
    bounds: *const TextureBounds,
    submit_flags: u32,
) -> i32 {
    let original = match HOOKS.call_original(submit_detour as SubmitFn) {
        Some(original) => original,
        None => return COMPOSITOR_ERROR_REQUEST_FAILED,
    };

    let guard = HookGuard::enter();
    if guard.already_inside() || texture.is_null() {
        return original(compositor, eye, texture, bounds, submit_flags);
    }

    let mut submitted = SubmittedTexture::copy_from(texture, submit_flags);
    match process_submit(eye, &submitted, bounds) {
        Some(submit_override) => {
            let replaced = submitted.texture_mut();
            replaced.handle = D3D11::texture_as_raw(&submit_override.texture);
            replaced.color_space = submit_override.color_space;
            original(
                compositor,
                eye,
                submitted.as_ptr(),
                &submit_override.bounds,
                submit_flags,
            )
        }
        None => original(compositor, eye, texture, bounds, submit_flags),
    }
}

pub fn resolve(name: &str, original: usize) -> Option<usize> {
    match name {
        "VRClientCoreFactory" => resolve_detour(
            name,
            original,
            client_core_factory_detour as ClientCoreFactoryFn,
        ),
        _ => None,
    }
}

pub fn on_runtime_loaded(_: HMODULE) {
    if !RUNTIME_DETECTED.swap(true, Ordering::SeqCst) {
        info!("{} is loaded in the process", OPENVR_MODULE_NAME);
    }
}

pub fn shutdown() {
    MANAGER.lock().take();
    CLIENT_CORE.store(0, Ordering::SeqCst);
    SYSTEM.store(0, Ordering::SeqCst);
}
