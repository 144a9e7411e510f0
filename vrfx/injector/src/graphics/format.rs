/// DXGI-compatible pixel format code.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct Format(pub u32);

impl Format {
    pub const UNKNOWN: Format = Format(0);
    pub const R32G32B32A32_TYPELESS: Format = Format(1);
    pub const R32G32B32A32_FLOAT: Format = Format(2);
    pub const R32G32B32_TYPELESS: Format = Format(5);
    pub const R32G32B32_FLOAT: Format = Format(6);
    pub const R16G16B16A16_TYPELESS: Format = Format(9);
    pub const R16G16B16A16_FLOAT: Format = Format(10);
    pub const R10G10B10A2_TYPELESS: Format = Format(23);
    pub const R10G10B10A2_UNORM: Format = Format(24);
    pub const R10G10B10A2_UINT: Format = Format(25);
    pub const R8G8B8A8_TYPELESS: Format = Format(27);
    pub const R8G8B8A8_UNORM: Format = Format(28);
    pub const R8G8B8A8_UNORM_SRGB: Format = Format(29);
    pub const R32_UINT: Format = Format(42);
    pub const R16_UINT: Format = Format(57);
    pub const R8_UINT: Format = Format(62);
    pub const B8G8R8A8_UNORM: Format = Format(87);
    pub const B8G8R8X8_UNORM: Format = Format(88);
    pub const B8G8R8A8_TYPELESS: Format = Format(90);
    pub const B8G8R8A8_UNORM_SRGB: Format = Format(91);
    pub const B8G8R8X8_TYPELESS: Format = Format(92);
    pub const B8G8R8X8_UNORM_SRGB: Format = Format(93);

    /// Concrete format used for views of a typeless texture.
    pub fn typeless_to_typed(self) -> Format {
        match self {
            Format::R32G32B32A32_TYPELESS => Format::R32G32B32A32_FLOAT,
            Format::R32G32B32_TYPELESS => Format::R32G32B32_FLOAT,
            Format::R16G16B16A16_TYPELESS => Format::R16G16B16A16_FLOAT,
            Format::R10G10B10A2_TYPELESS => Format::R10G10B10A2_UINT,
            Format::R8G8B8A8_TYPELESS => Format::R8G8B8A8_UNORM,
            Format::B8G8R8A8_TYPELESS => Format::B8G8R8A8_UNORM,
            other => other,
        }
    }

    pub fn srgb_to_typeless(self) -> Format {
        match self {
            Format::B8G8R8A8_UNORM_SRGB => Format::B8G8R8A8_TYPELESS,
            Format::B8G8R8X8_UNORM_SRGB => Format::B8G8R8X8_TYPELESS,
            Format::R8G8B8A8_UNORM_SRGB => Format::R8G8B8A8_TYPELESS,
            other => other,
        }
    }

    pub fn srgb_to_linear(self) -> Format {
        match self {
            Format::B8G8R8A8_UNORM_SRGB => Format::B8G8R8A8_UNORM,
            Format::B8G8R8X8_UNORM_SRGB => Format::B8G8R8X8_UNORM,
            Format::R8G8B8A8_UNORM_SRGB => Format::R8G8B8A8_UNORM,
            other => other,
        }
    }

    pub fn is_srgb(self) -> bool {
        match self {
            Format::B8G8R8A8_UNORM_SRGB
            | Format::B8G8R8X8_UNORM_SRGB
            | Format::R8G8B8A8_UNORM_SRGB => true,
            _ => false,
        }
    }

    pub fn is_typeless(self) -> bool {
        match self {
            Format::R32G32B32A32_TYPELESS
            | Format::R32G32B32_TYPELESS
            | Format::R16G16B16A16_TYPELESS
            | Format::R10G10B10A2_TYPELESS
            | Format::R8G8B8A8_TYPELESS
            | Format::B8G8R8A8_TYPELESS
            | Format::B8G8R8X8_TYPELESS => true,
            _ => false,
        }
    }

    pub fn is_10_bit(self) -> bool {
        match self {
            Format::R10G10B10A2_TYPELESS | Format::R10G10B10A2_UNORM => true,
            _ => false,
        }
    }
}
