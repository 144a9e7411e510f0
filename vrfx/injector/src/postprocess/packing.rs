// Host side packing helpers for the kernel constant blocks. The layouts are read bit for bit by
// the compute kernels.

pub fn float_bits(value: f32) -> u32 {
    value.to_bits()
}

/// f32 to f16 conversion that truncates the mantissa, matching the table based conversion the
/// kernels were tuned with.
pub fn f32_to_f16_truncated(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let biased_exponent = ((bits >> 23) & 0xff) as i32;
    let mantissa = bits & 0x7f_ffff;

    if biased_exponent == 0xff {
        // infinity and NaN
        return sign | 0x7c00 | (mantissa >> 13) as u16;
    }

    let exponent = biased_exponent - 127;
    let magnitude = if exponent < -24 {
        0
    } else if exponent < -14 {
        (0x0400 >> (-exponent - 14)) as u32 + (mantissa >> (-exponent - 1))
    } else if exponent <= 15 {
        (((exponent + 15) as u32) << 10) + (mantissa >> 13)
    } else {
        0x7c00
    };

    sign | magnitude as u16
}

/// Two halves packed in one word, the first in the low 16 bits.
pub fn pack_half2(low: f32, high: f32) -> u32 {
    f32_to_f16_truncated(low) as u32 | (f32_to_f16_truncated(high) as u32) << 16
}

/// Truncating float to integer conversion used for the projection center and radius fields.
pub fn truncate(value: f32) -> u32 {
    value as u32
}
