use super::*;
use crate::{graphics::d3d11::Com, runtimes::oculus::*};
use std::{
    os::raw::c_void,
    slice,
    sync::atomic::{AtomicBool, Ordering},
};
use vrfx_common::*;
use winapi::{
    shared::guiddef::GUID,
    um::{d3d11::ID3D11Texture2D, unknwnbase::IUnknown},
    Interface,
};

const TRACE_CONTEXT: &str = "Oculus";

const OVR_ERROR_INITIALIZE: i32 = -3000;

type Session = *mut c_void;
type SwapChain = *mut c_void;

type InitializeFn = unsafe extern "system" fn(*const InitParams) -> i32;
type EndFrameFn =
    unsafe extern "system" fn(Session, i64, *const c_void, *const *const c_void, u32) -> i32;
type GetFovTextureSizeFn = unsafe extern "system" fn(Session, i32, FovPort, f32) -> Sizei;
type DestroyFn = unsafe extern "system" fn(Session);

type ChainLengthFn = unsafe extern "system" fn(Session, SwapChain, *mut i32) -> i32;
type ChainBufferFn =
    unsafe extern "system" fn(Session, SwapChain, i32, GUID, *mut *mut c_void) -> i32;
type ChainDescFn = unsafe extern "system" fn(Session, SwapChain, *mut SwapChainDesc) -> i32;
type ChainIndexFn = unsafe extern "system" fn(Session, SwapChain, *mut i32) -> i32;
type CreateChainFn = unsafe extern "system" fn(
    Session,
    *mut IUnknown,
    *const SwapChainDesc,
    *mut SwapChain,
) -> i32;
type CommitChainFn = unsafe extern "system" fn(Session, SwapChain) -> i32;
type DestroyChainFn = unsafe extern "system" fn(Session, SwapChain);

fn ovr_result(result: i32, operation: &str) -> StrResult {
    if result >= 0 {
        Ok(())
    } else {
        trace_str!("{} failed with error {}", operation, result)
    }
}

/// Swap chain entry points of the loaded runtime library.
#[derive(Clone, Copy)]
struct OvrApi {
    chain_length: ChainLengthFn,
    chain_buffer: ChainBufferFn,
    chain_desc: ChainDescFn,
    chain_index: ChainIndexFn,
    create_chain: CreateChainFn,
    commit_chain: CommitChainFn,
    destroy_chain: DestroyChainFn,
}

impl OvrApi {
    unsafe fn load(module: HMODULE) -> StrResult<Self> {
        Ok(Self {
            chain_length: proc(module, "ovr_GetTextureSwapChainLength")?,
            chain_buffer: proc(module, "ovr_GetTextureSwapChainBufferDX")?,
            chain_desc: proc(module, "ovr_GetTextureSwapChainDesc")?,
            chain_index: proc(module, "ovr_GetTextureSwapChainCurrentIndex")?,
            create_chain: proc(module, "ovr_CreateTextureSwapChainDX")?,
            commit_chain: proc(module, "ovr_CommitTextureSwapChain")?,
            destroy_chain: proc(module, "ovr_DestroyTextureSwapChain")?,
        })
    }
}

struct OvrRuntime {
    api: OvrApi,
}

impl OculusRuntime<D3D11> for OvrRuntime {
    type Session = Session;
    type SwapChain = SwapChain;

    fn chain_length(&self, session: Session, chain: SwapChain) -> StrResult<usize> {
        let mut length = 0;
        ovr_result(
            unsafe { (self.api.chain_length)(session, chain, &mut length) },
            "ovr_GetTextureSwapChainLength",
        )?;
        Ok(length.max(0) as usize)
    }

    fn chain_texture(
        &self,
        session: Session,
        chain: SwapChain,
        index: usize,
    ) -> StrResult<Com<ID3D11Texture2D>> {
        let mut texture = null_mut();
        ovr_result(
            unsafe {
                (self.api.chain_buffer)(
                    session,
                    chain,
                    index as i32,
                    ID3D11Texture2D::uuidof(),
                    &mut texture,
                )
            },
            "ovr_GetTextureSwapChainBufferDX",
        )?;
        trace_none!(
            unsafe { Com::from_owned(texture as *mut ID3D11Texture2D) },
            "Swap chain buffer {} is null",
            index
        )
    }

    fn chain_desc(&self, session: Session, chain: SwapChain) -> StrResult<SwapChainDesc> {
        let mut desc = SwapChainDesc::default();
        ovr_result(
            unsafe { (self.api.chain_desc)(session, chain, &mut desc) },
            "ovr_GetTextureSwapChainDesc",
        )?;
        Ok(desc)
    }

    fn current_index(&self, session: Session, chain: SwapChain) -> StrResult<usize> {
        let mut index = 0;
        ovr_result(
            unsafe { (self.api.chain_index)(session, chain, &mut index) },
            "ovr_GetTextureSwapChainCurrentIndex",
        )?;
        Ok(index.max(0) as usize)
    }

    fn create_chain(
        &self,
        session: Session,
        device: &Com<winapi::um::d3d11::ID3D11Device>,
        desc: &SwapChainDesc,
    ) -> StrResult<SwapChain> {
        let mut chain = null_mut();
        ovr_result(
            unsafe {
                (self.api.create_chain)(session, device.as_raw() as *mut IUnknown, desc, &mut chain)
            },
            "ovr_CreateTextureSwapChainDX",
        )?;
        if chain.is_null() {
            return trace_str!("ovr_CreateTextureSwapChainDX returned a null swap chain");
        }
        Ok(chain)
    }

    fn commit_chain(&self, session: Session, chain: SwapChain) -> StrResult {
        ovr_result(
            unsafe { (self.api.commit_chain)(session, chain) },
            "ovr_CommitTextureSwapChain",
        )
    }

    fn destroy_chain(&self, session: Session, chain: SwapChain) {
        unsafe { (self.api.destroy_chain)(session, chain) };
    }
}

type Manager = OculusManager<D3D11, NvApiShadingRates, OvrRuntime>;

lazy_static! {
    static ref ABI: Mutex<LayerAbi> = Mutex::new(LayerAbi::Legacy);
    static ref API: Mutex<Option<OvrApi>> = Mutex::new(None);
    static ref MANAGER: Mutex<Option<HostOwned<Manager>>> = Mutex::new(None);
}

static RUNTIME_DETECTED: AtomicBool = AtomicBool::new(false);

unsafe extern "system" fn initialize_detour(params: *const InitParams) -> i32 {
    let original = match HOOKS.call_original(initialize_detour as InitializeFn) {
        Some(original) => original,
        None => return OVR_ERROR_INITIALIZE,
    };

    let abi = layer_abi(params.as_ref());
    info!(
        "ovr_Initialize requested minor version {}, using {:?} layer headers",
        params.as_ref().map(|p| p.requested_minor_version).unwrap_or(0),
        abi
    );
    *ABI.lock() = abi;

    original(params)
}

// Index and redirected copy of the eye layer, if processing replaced its textures.
unsafe fn process_layers(
    session: Session,
    layers: &[*const c_void],
) -> Option<(usize, EyeFovLayerCopy)> {
    let abi = *ABI.lock();
    let (index, mut copy) = EyeFovLayerCopy::find(abi, layers)?;

    let submitted = copy.eye_layer();
    let mut layer = submitted.clone();

    let mut manager = MANAGER.lock();
    if manager.is_none() {
        let context = context()?;
        let api = (*API.lock())?;
        *manager = Some(HostOwned(OculusManager::new(
            context.settings.clone(),
            context.kernels.clone(),
            nvapi_extension(),
            OvrRuntime { api },
        )));
    }
    manager.as_mut()?.0.on_frame_submission(session, &mut layer);

    if layer.color_textures == submitted.color_textures && layer.viewports == submitted.viewports {
        None
    } else {
        copy.write_back(&layer);
        Some((index, copy))
    }
}

unsafe extern "system" fn end_frame_detour(
    session: Session,
    frame_index: i64,
    view_scale_desc: *const c_void,
    layer_ptr_list: *const *const c_void,
    layer_count: u32,
) -> i32 {
    let original = match HOOKS.call_original(end_frame_detour as EndFrameFn) {
        Some(original) => original,
        None => return OVR_ERROR_INITIALIZE,
    };

    let guard = HookGuard::enter();
    if guard.already_inside() || layer_ptr_list.is_null() || layer_count == 0 {
        return original(session, frame_index, view_scale_desc, layer_ptr_list, layer_count);
    }

    let layers = slice::from_raw_parts(layer_ptr_list, layer_count as usize);
    match process_layers(session, layers) {
        Some((index, copy)) => {
            let mut substituted = layers.to_vec();
            substituted[index] = copy.header_ptr();
            original(
                session,
                frame_index,
                view_scale_desc,
                substituted.as_ptr(),
                layer_count,
            )
        }
        None => original(session, frame_index, view_scale_desc, layer_ptr_list, layer_count),
    }
}

unsafe extern "system" fn get_fov_texture_size_detour(
    session: Session,
    eye: i32,
    fov: FovPort,
    pixels_per_display_pixel: f32,
) -> Sizei {
    let original = match HOOKS.call_original(get_fov_texture_size_detour as GetFovTextureSizeFn) {
        Some(original) => original,
        None => return Sizei::default(),
    };
    let size = original(session, eye, fov, pixels_per_display_pixel);

    let guard = HookGuard::enter();
    if guard.already_inside() {
        return size;
    }
    match context() {
        Some(context) => {
            let settings = context.settings.snapshot();
            let adjusted = adjust_fov_texture_size(&settings.upscaling, size);
            info!(
                "Changing fov texture size of eye {} from {}x{} to {}x{}",
                eye, size.w, size.h, adjusted.w, adjusted.h
            );
            adjusted
        }
        None => size,
    }
}

unsafe extern "system" fn destroy_detour(session: Session) {
    info!("ovr_Destroy was called, releasing resources...");
    shutdown();
    if let Some(original) = HOOKS.call_original(destroy_detour as DestroyFn) {
        original(session);
    }
}

pub fn resolve(name: &str, original: usize) -> Option<usize> {
    match name {
        "ovr_Initialize" => resolve_detour(name, original, initialize_detour as InitializeFn),
        "ovr_EndFrame" => resolve_detour(name, original, end_frame_detour as EndFrameFn),
        "ovr_GetFovTextureSize" => resolve_detour(
            name,
            original,
            get_fov_texture_size_detour as GetFovTextureSizeFn,
        ),
        "ovr_Destroy" => resolve_detour(name, original, destroy_detour as DestroyFn),
        _ => None,
    }
}

pub fn on_runtime_loaded(module: HMODULE) {
    if RUNTIME_DETECTED.swap(true, Ordering::SeqCst) {
        return;
    }
    info!("{} is loaded in the process", OCULUS_MODULE_NAME);

    match unsafe { OvrApi::load(module) } {
        Ok(api) => *API.lock() = Some(api),
        Err(e) => error!("Cannot load the swap chain functions: {}", e),
    }
}

pub fn shutdown() {
    if let Some(mut manager) = MANAGER.lock().take() {
        manager.0.shutdown();
    }
}
