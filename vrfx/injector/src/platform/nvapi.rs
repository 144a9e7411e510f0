use super::*;
use crate::{
    foveation::{ShadingRateExtension, ViewportShadingRate},
    graphics::{d3d11::Com, nvapi::*, Backend, VIEWPORT_SLOTS},
};
use std::os::raw::c_void;
use vrfx_common::*;
use winapi::um::{
    d3d11::{ID3D11Device, ID3D11DeviceContext, ID3D11Texture2D},
    unknwnbase::IUnknown,
};

const TRACE_CONTEXT: &str = "NVAPI";

const NVAPI_MODULE_NAME: &str = "nvapi64.dll";

type QueryInterfaceFn = unsafe extern "system" fn(u32) -> *mut c_void;
type InitializeFn = unsafe extern "system" fn() -> i32;
type UnloadFn = unsafe extern "system" fn() -> i32;
type GetGraphicsCapabilitiesFn =
    unsafe extern "system" fn(*mut IUnknown, u32, *mut GraphicsCaps) -> i32;
type CreateShadingRateViewFn = unsafe extern "system" fn(
    *mut ID3D11Device,
    *mut c_void,
    *const ShadingRateViewDesc,
    *mut *mut IUnknown,
) -> i32;
type SetShadingRateViewFn = unsafe extern "system" fn(*mut ID3D11DeviceContext, *mut IUnknown) -> i32;
type SetViewportsShadingRatesFn =
    unsafe extern "system" fn(*mut ID3D11DeviceContext, *const ViewportsShadingRateDesc) -> i32;

fn nvapi_result(status: i32, operation: &str) -> StrResult {
    if status == NVAPI_OK {
        Ok(())
    } else {
        trace_str!("{} failed with status {}", operation, status)
    }
}

unsafe fn query<F: FnPtr>(query_interface: QueryInterfaceFn, id: u32, name: &str) -> StrResult<F> {
    let address = query_interface(id);
    if address.is_null() {
        trace_str!("{} is not provided by the driver", name)
    } else {
        Ok(F::from_addr(address as usize))
    }
}

fn load_module(name: &str) -> StrResult<HMODULE> {
    let wide_name = name.encode_utf16().chain(Some(0)).collect::<Vec<_>>();
    let module = unsafe { LoadLibraryW(wide_name.as_ptr()) };
    if module.is_null() {
        trace_str!("Cannot load {}", name)
    } else {
        Ok(module)
    }
}

/// Variable rate shading through the NVIDIA driver. Every successful load initializes the driver
/// interface once and `unload` releases it.
pub struct NvApiShadingRates {
    unload: UnloadFn,
    create_view: CreateShadingRateViewFn,
    set_view: SetShadingRateViewFn,
    set_viewport_rates: SetViewportsShadingRatesFn,
    loaded: bool,
}

impl NvApiShadingRates {
    pub fn load(device: &Com<ID3D11Device>) -> StrResult<Self> {
        info!("Trying to load NVAPI...");
        let module = load_module(NVAPI_MODULE_NAME)?;

        let extension = unsafe {
            let query_interface: QueryInterfaceFn = proc(module, "nvapi_QueryInterface")?;
            let initialize: InitializeFn =
                query(query_interface, INITIALIZE_ID, "NvAPI_Initialize")?;
            let mut extension = Self {
                unload: query(query_interface, UNLOAD_ID, "NvAPI_Unload")?,
                create_view: query(
                    query_interface,
                    CREATE_SHADING_RATE_VIEW_ID,
                    "NvAPI_D3D11_CreateShadingRateResourceView",
                )?,
                set_view: query(
                    query_interface,
                    SET_SHADING_RATE_VIEW_ID,
                    "NvAPI_D3D11_RSSetShadingRateResourceView",
                )?,
                set_viewport_rates: query(
                    query_interface,
                    SET_VIEWPORTS_SHADING_RATES_ID,
                    "NvAPI_D3D11_RSSetViewportsPixelShadingRates",
                )?,
                loaded: true,
            };
            nvapi_result(initialize(), "NvAPI_Initialize")?;

            // older drivers do not report capabilities, view creation fails on them instead
            if let Ok(get_caps) = query::<GetGraphicsCapabilitiesFn>(
                query_interface,
                GET_GRAPHICS_CAPABILITIES_ID,
                "NvAPI_D3D1x_GetGraphicsCapabilities",
            ) {
                let mut caps = GraphicsCaps::default();
                let status = get_caps(
                    device.as_raw() as *mut IUnknown,
                    struct_version::<GraphicsCaps>(1),
                    &mut caps,
                );
                if status != NVAPI_OK || !caps.variable_rate_shading_supported() {
                    extension.unload();
                    return trace_str!("The device does not support variable rate shading");
                }
            }
            extension
        };

        info!("NVAPI initialized, variable rate shading is available");
        Ok(extension)
    }
}

impl ShadingRateExtension<D3D11> for NvApiShadingRates {
    type View = Com<IUnknown>;

    fn create_view(
        &mut self,
        device: &Com<ID3D11Device>,
        pattern: &Com<ID3D11Texture2D>,
        array_size: u32,
    ) -> StrResult<Com<IUnknown>> {
        let format = D3D11::texture_desc(pattern).format.0;
        let desc = ShadingRateViewDesc::new(format, array_size);

        let mut view = null_mut();
        nvapi_result(
            unsafe {
                (self.create_view)(
                    device.as_raw(),
                    pattern.as_raw() as *mut c_void,
                    &desc,
                    &mut view,
                )
            },
            "NvAPI_D3D11_CreateShadingRateResourceView",
        )?;
        trace_none!(
            unsafe { Com::from_owned(view) },
            "NvAPI_D3D11_CreateShadingRateResourceView returned a null view"
        )
    }

    fn bind_view(&mut self, context: &Com<ID3D11DeviceContext>, view: &Com<IUnknown>) -> StrResult {
        nvapi_result(
            unsafe { (self.set_view)(context.as_raw(), view.as_raw()) },
            "NvAPI_D3D11_RSSetShadingRateResourceView",
        )
    }

    fn set_viewport_rates(
        &mut self,
        context: &Com<ID3D11DeviceContext>,
        rates: &[ViewportShadingRate],
    ) -> StrResult {
        let mut viewports = [ViewportShadingRateDesc::default(); VIEWPORT_SLOTS];
        let count = rates.len().min(VIEWPORT_SLOTS);
        for (viewport, rate) in viewports.iter_mut().zip(rates) {
            *viewport = rate.into();
        }

        let desc = ViewportsShadingRateDesc::new(&viewports[..count]);
        nvapi_result(
            unsafe { (self.set_viewport_rates)(context.as_raw(), &desc) },
            "NvAPI_D3D11_RSSetViewportsPixelShadingRates",
        )
    }

    fn unload(&mut self) {
        if !self.loaded {
            return;
        }
        self.loaded = false;

        let status = unsafe { (self.unload)() };
        if status == NVAPI_OK {
            info!("NVAPI unloaded");
        } else {
            warn!("NvAPI_Unload failed with status {}", status);
        }
    }
}
