// Structures of the NVIDIA driver interface for variable rate shading, laid out the way the driver
// reads them.

use crate::foveation::*;
use std::mem::size_of;

pub const NVAPI_OK: i32 = 0;

// Function ids resolved through nvapi_QueryInterface
pub const INITIALIZE_ID: u32 = 0x0150_e828;
pub const UNLOAD_ID: u32 = 0xd22b_dd7e;
pub const GET_GRAPHICS_CAPABILITIES_ID: u32 = 0x52b1_499a;
pub const CREATE_SHADING_RATE_VIEW_ID: u32 = 0x99ca_2dff;
pub const SET_SHADING_RATE_VIEW_ID: u32 = 0x1b0c_2f83;
pub const SET_VIEWPORTS_SHADING_RATES_ID: u32 = 0x34f7_938f;

const SRRV_DIMENSION_TEXTURE_2D: u32 = 4;
const SRRV_DIMENSION_TEXTURE_2D_ARRAY: u32 = 5;

/// Versioned structures carry their size in the low word.
pub fn struct_version<T>(version: u32) -> u32 {
    size_of::<T>() as u32 | version << 16
}

#[repr(C)]
#[derive(Clone, Copy, Default, Debug)]
pub struct GraphicsCaps {
    pub flags: u32,
    pub reserved: [u32; 7],
}

impl GraphicsCaps {
    pub fn variable_rate_shading_supported(&self) -> bool {
        self.flags & 0b10 != 0
    }
}

// The texture and texture array variants of the view union are flattened.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct ShadingRateViewDesc {
    pub version: u32,
    pub format: u32,
    pub view_dimension: u32,
    pub mip_slice: u32,
    pub first_array_slice: u32,
    pub array_size: u32,
}

impl ShadingRateViewDesc {
    pub fn new(format: u32, array_size: u32) -> Self {
        let mut desc = Self {
            version: struct_version::<Self>(1),
            format,
            view_dimension: SRRV_DIMENSION_TEXTURE_2D,
            ..Default::default()
        };
        if array_size > 1 {
            desc.view_dimension = SRRV_DIMENSION_TEXTURE_2D_ARRAY;
            desc.array_size = array_size;
        }
        desc
    }
}

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct ViewportShadingRateDesc {
    pub enabled: bool,
    pub table: [u32; SHADING_RATE_TABLE_SIZE],
}

impl From<&ViewportShadingRate> for ViewportShadingRateDesc {
    fn from(rate: &ViewportShadingRate) -> Self {
        let mut table = [0; SHADING_RATE_TABLE_SIZE];
        for (entry, &value) in table.iter_mut().zip(rate.table.iter()) {
            *entry = value as u32;
        }

        Self {
            enabled: rate.enabled,
            table,
        }
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct ViewportsShadingRateDesc {
    pub version: u32,
    pub viewport_count: u32,
    pub viewports: *const ViewportShadingRateDesc,
}

impl ViewportsShadingRateDesc {
    /// The result borrows `viewports` through a raw pointer and must not outlive it.
    pub fn new(viewports: &[ViewportShadingRateDesc]) -> Self {
        Self {
            version: struct_version::<Self>(1),
            viewport_count: viewports.len() as u32,
            viewports: viewports.as_ptr(),
        }
    }
}
