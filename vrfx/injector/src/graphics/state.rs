use super::*;

/// Every binding the injected passes can disturb. Holds one reference to each bound object until
/// it is restored.
pub struct PipelineSnapshot<B: Backend> {
    vertex_shader: Option<B::VertexShader>,
    pixel_shader: Option<B::PixelShader>,
    compute_shader: Option<B::ComputeShader>,
    input_layout: Option<B::InputLayout>,
    topology: u32,
    vertex_buffers: Vec<VertexBufferBinding<B>>,
    index_buffer: IndexBufferBinding<B>,
    render_targets: Vec<Option<B::RenderTargetView>>,
    depth_stencil_view: Option<B::DepthStencilView>,
    rasterizer_state: Option<B::RasterizerState>,
    depth_stencil_state: Option<B::DepthStencilState>,
    stencil_ref: u32,
    viewports: Vec<NativeViewport>,
    vs_constant_buffer: Option<B::Buffer>,
    ps_constant_buffer: Option<B::Buffer>,
    cs_constant_buffer: Option<B::Buffer>,
    cs_shader_resources: Vec<Option<B::ShaderResourceView>>,
    cs_unordered_access_views: Vec<Option<B::UnorderedAccessView>>,
}

impl<B: Backend> PipelineSnapshot<B> {
    pub fn capture(context: &B::Context) -> Self {
        let (render_targets, depth_stencil_view) = context.render_targets();
        let (depth_stencil_state, stencil_ref) = context.depth_stencil_state();

        Self {
            vertex_shader: context.vertex_shader(),
            pixel_shader: context.pixel_shader(),
            compute_shader: context.compute_shader(),
            input_layout: context.input_layout(),
            topology: context.primitive_topology(),
            vertex_buffers: context.vertex_buffers(),
            index_buffer: context.index_buffer(),
            render_targets,
            depth_stencil_view,
            rasterizer_state: context.rasterizer_state(),
            depth_stencil_state,
            stencil_ref,
            viewports: context.viewports(),
            vs_constant_buffer: context.constant_buffer(ShaderStage::Vertex),
            ps_constant_buffer: context.constant_buffer(ShaderStage::Pixel),
            cs_constant_buffer: context.constant_buffer(ShaderStage::Compute),
            cs_shader_resources: context.cs_shader_resources(),
            cs_unordered_access_views: context.cs_unordered_access_views(),
        }
    }

    // Render targets are detached first and rebound last: a texture can only be bound for output
    // once nothing still reads from it.
    pub fn restore(self, context: &B::Context) {
        context.set_render_targets(&[], None);

        context.set_vertex_shader(self.vertex_shader.as_ref());
        context.set_pixel_shader(self.pixel_shader.as_ref());
        context.set_compute_shader(self.compute_shader.as_ref());
        context.set_input_layout(self.input_layout.as_ref());
        context.set_primitive_topology(self.topology);
        context.set_vertex_buffers(&self.vertex_buffers);
        context.set_index_buffer(&self.index_buffer);
        context.set_rasterizer_state(self.rasterizer_state.as_ref());
        context.set_depth_stencil_state(self.depth_stencil_state.as_ref(), self.stencil_ref);
        context.set_viewports(&self.viewports);
        context.set_constant_buffer(ShaderStage::Vertex, self.vs_constant_buffer.as_ref());
        context.set_constant_buffer(ShaderStage::Pixel, self.ps_constant_buffer.as_ref());
        context.set_constant_buffer(ShaderStage::Compute, self.cs_constant_buffer.as_ref());
        context.set_cs_unordered_access_views(0, &self.cs_unordered_access_views);
        context.set_cs_shader_resources(0, &self.cs_shader_resources);

        context.set_render_targets(&self.render_targets, self.depth_stencil_view.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphics::mock::*;

    fn bind_host_state(device: &MockDevice, context: &MockContext) -> Vec<MockHandle> {
        let objects = (0..12)
            .map(|i| device.create_object(&format!("host {}", i)))
            .collect::<Vec<_>>();

        context.set_vertex_shader(Some(&objects[0]));
        context.set_pixel_shader(Some(&objects[1]));
        context.set_input_layout(Some(&objects[2]));
        context.set_primitive_topology(4);
        let mut vertex_buffers = vec![VertexBufferBinding::<Mock>::default(); VERTEX_BUFFER_SLOTS];
        vertex_buffers[0] = VertexBufferBinding {
            buffer: Some(objects[3].clone()),
            stride: 32,
            offset: 16,
        };
        context.set_vertex_buffers(&vertex_buffers);
        context.set_index_buffer(&IndexBufferBinding {
            buffer: Some(objects[4].clone()),
            format: Format::R16_UINT,
            offset: 8,
        });
        context.set_render_targets(&[Some(objects[5].clone()), None], Some(&objects[6]));
        context.set_rasterizer_state(Some(&objects[7]));
        context.set_depth_stencil_state(Some(&objects[8]), 3);
        context.set_viewports(&[NativeViewport {
            width: 1024.,
            height: 768.,
            max_depth: 1.,
            ..Default::default()
        }]);
        context.set_constant_buffer(ShaderStage::Vertex, Some(&objects[9]));
        context.set_cs_shader_resources(5, &[Some(objects[10].clone())]);
        context.set_cs_unordered_access_views(1, &[Some(objects[11].clone())]);

        objects
    }

    fn disturb_state(device: &MockDevice, context: &MockContext) {
        let shader = device.create_object("ours");
        context.set_render_targets(&[], None);
        context.set_compute_shader(Some(&shader));
        context.set_cs_shader_resources(0, &[Some(shader.clone())]);
        context.set_cs_unordered_access_views(0, &[Some(shader.clone())]);
        context.set_constant_buffer(ShaderStage::Compute, Some(&shader));
        context.set_viewports(&[]);
        context.set_vertex_shader(None);
        context.set_primitive_topology(1);
    }

    #[test]
    fn restore_is_binding_exact() {
        let device = MockDevice::new();
        let context = device.immediate_context().unwrap();
        bind_host_state(&device, &context);
        let before = context.bindings();

        let snapshot = PipelineSnapshot::<Mock>::capture(&context);
        disturb_state(&device, &context);
        assert_ne!(context.bindings(), before);

        snapshot.restore(&context);
        assert_eq!(context.bindings(), before);
    }

    #[test]
    fn restore_is_reference_neutral() {
        let device = MockDevice::new();
        let context = device.immediate_context().unwrap();
        let objects = bind_host_state(&device, &context);
        let counts = objects.iter().map(MockHandle::ref_count).collect::<Vec<_>>();

        let snapshot = PipelineSnapshot::<Mock>::capture(&context);
        assert!(objects[0].ref_count() > counts[0]);
        disturb_state(&device, &context);
        snapshot.restore(&context);

        let after = objects.iter().map(MockHandle::ref_count).collect::<Vec<_>>();
        assert_eq!(after, counts);
    }

    #[test]
    fn render_targets_are_rebound_last() {
        let device = MockDevice::new();
        let context = device.immediate_context().unwrap();
        bind_host_state(&device, &context);

        let snapshot = PipelineSnapshot::<Mock>::capture(&context);
        context.clear_log();
        snapshot.restore(&context);

        let log = context.log();
        assert_eq!(log.first(), Some(&Call::SetRenderTargets(0)));
        assert_eq!(log.last(), Some(&Call::SetRenderTargets(RENDER_TARGET_SLOTS)));
    }
}
