use crate::data::UpscalingDesc;

fn make_even(value: u32) -> u32 {
    value + (value & 1)
}

/// Resolution the host should render at so that upscaling can bring it back to the native one.
pub fn adjust_render_resolution(desc: &UpscalingDesc, width: u32, height: u32) -> (u32, u32) {
    if !desc.enabled || desc.render_scale >= 1. {
        return (width, height);
    }

    let scale = desc.render_scale;
    (
        make_even((width as f32 * scale).round() as u32),
        make_even((height as f32 * scale).round() as u32),
    )
}

/// Resolution of the upscaled image produced from a host image of the given size.
pub fn adjust_output_resolution(desc: &UpscalingDesc, width: u32, height: u32) -> (u32, u32) {
    if !desc.enabled {
        return (width, height);
    }

    let scale = desc.render_scale;
    let scale_fn = |value: u32| {
        let scaled = if scale < 1. {
            value as f32 / scale
        } else {
            value as f32 * scale
        };
        make_even(scaled.round() as u32)
    };

    (scale_fn(width), scale_fn(height))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(enabled: bool, render_scale: f32) -> UpscalingDesc {
        UpscalingDesc {
            enabled,
            render_scale,
            ..Default::default()
        }
    }

    #[test]
    fn disabled_is_identity() {
        assert_eq!(adjust_render_resolution(&desc(false, 0.7), 2016, 2240), (2016, 2240));
        assert_eq!(adjust_output_resolution(&desc(false, 0.7), 2016, 2240), (2016, 2240));
    }

    #[test]
    fn render_resolution_is_even() {
        // 1000 * 0.77 = 770, 999 * 0.77 = 769.23 -> 769 -> 770
        assert_eq!(adjust_render_resolution(&desc(true, 0.77), 1000, 999), (770, 770));
        assert_eq!(adjust_render_resolution(&desc(true, 1.), 1001, 999), (1001, 999));
    }

    #[test]
    fn output_resolution() {
        // 2000 / 0.7 = 2857.14 -> 2857 -> 2858, 1000 / 0.7 = 1428.57 -> 1429 -> 1430
        assert_eq!(adjust_output_resolution(&desc(true, 0.7), 2000, 1000), (2858, 1430));
        assert_eq!(adjust_output_resolution(&desc(true, 1.), 1001, 1000), (1002, 1000));
    }

    #[test]
    fn half_scale_round_trip() {
        let upscaling = desc(true, 0.5);
        let render = adjust_render_resolution(&upscaling, 1000, 1000);
        assert_eq!(render, (500, 500));
        assert_eq!(adjust_output_resolution(&upscaling, render.0, render.1), (1000, 1000));
    }
}
