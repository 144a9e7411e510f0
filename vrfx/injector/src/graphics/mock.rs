// In-memory backend used by the unit tests. Objects are reference counted with `Rc` so that tests
// can check that the injected passes leave host reference counts untouched.

use super::*;
use std::{cell::RefCell, collections::HashMap, hash::Hasher, rc::Rc};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Mock;

pub struct MockObject {
    label: String,
    device: MockDevice,
    texture: Option<TextureDesc>,
    sampler: Option<SamplerDesc>,
    render_target: Option<RenderTargetInfo>,
}

#[derive(Clone)]
pub struct MockHandle(Rc<MockObject>);

impl MockHandle {
    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.0)
    }

    pub fn label(&self) -> &str {
        &self.0.label
    }
}

impl PartialEq for MockHandle {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for MockHandle {}

impl Hash for MockHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Rc::as_ptr(&self.0) as usize).hash(state)
    }
}

impl Debug for MockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0.label)
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct Bindings {
    pub vertex_shader: Option<MockHandle>,
    pub pixel_shader: Option<MockHandle>,
    pub compute_shader: Option<MockHandle>,
    pub input_layout: Option<MockHandle>,
    pub topology: u32,
    pub vertex_buffers: Vec<VertexBufferBinding<Mock>>,
    pub index_buffer: IndexBufferBinding<Mock>,
    pub render_targets: Vec<Option<MockHandle>>,
    pub depth_stencil_view: Option<MockHandle>,
    pub rasterizer_state: Option<MockHandle>,
    pub depth_stencil_state: Option<MockHandle>,
    pub stencil_ref: u32,
    pub viewports: Vec<NativeViewport>,
    pub constant_buffers: [Option<MockHandle>; 3],
    pub cs_shader_resources: Vec<Option<MockHandle>>,
    pub cs_unordered_access_views: Vec<Option<MockHandle>>,
    pub cs_samplers: Vec<Option<MockHandle>>,
    pub ps_samplers: Vec<Option<MockHandle>>,
}

impl Default for Bindings {
    fn default() -> Self {
        Self {
            vertex_shader: None,
            pixel_shader: None,
            compute_shader: None,
            input_layout: None,
            topology: 0,
            vertex_buffers: vec![VertexBufferBinding::default(); VERTEX_BUFFER_SLOTS],
            index_buffer: IndexBufferBinding::default(),
            render_targets: vec![None; RENDER_TARGET_SLOTS],
            depth_stencil_view: None,
            rasterizer_state: None,
            depth_stencil_state: None,
            stencil_ref: 0,
            viewports: vec![],
            constant_buffers: [None, None, None],
            cs_shader_resources: vec![None; SHADER_RESOURCE_SLOTS],
            cs_unordered_access_views: vec![None; UNORDERED_ACCESS_SLOTS],
            cs_samplers: vec![None; SAMPLER_SLOTS],
            ps_samplers: vec![None; SAMPLER_SLOTS],
        }
    }
}

#[derive(Clone, PartialEq, Debug)]
pub enum Call {
    SetRenderTargets(usize),
    SetPsSamplers(u32, usize),
    Dispatch(String, [u32; 3]),
    UpdateBuffer(String),
    UpdateTexture(String, u32),
    Copy(String, String),
    Resolve(String, String),
}

#[derive(Default)]
struct MockState {
    bindings: Bindings,
    log: Vec<Call>,
    uploads: Vec<(String, Vec<u8>)>,
    created: Vec<String>,
    fail_creation: bool,
    context_lost: bool,
    injectors: Vec<Arc<DeviceInjector<Mock>>>,
    clock: u64,
    timestamps: HashMap<MockHandle, u64>,
}

#[derive(Clone)]
pub struct MockDevice(Rc<RefCell<MockState>>);

impl MockDevice {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(MockState::default())))
    }

    fn make(
        &self,
        label: &str,
        texture: Option<TextureDesc>,
        sampler: Option<SamplerDesc>,
        render_target: Option<RenderTargetInfo>,
    ) -> MockHandle {
        MockHandle(Rc::new(MockObject {
            label: label.to_owned(),
            device: self.clone(),
            texture,
            sampler,
            render_target,
        }))
    }

    fn create(
        &self,
        label: &str,
        texture: Option<TextureDesc>,
        sampler: Option<SamplerDesc>,
    ) -> StrResult<MockHandle> {
        let mut state = self.0.borrow_mut();
        if state.fail_creation {
            return Err(format!("Failed creating {}", label));
        }
        state.created.push(label.to_owned());
        drop(state);

        Ok(self.make(label, texture, sampler, None))
    }

    pub fn create_object(&self, label: &str) -> MockHandle {
        self.make(label, None, None, None)
    }

    pub fn create_host_texture(&self, label: &str, desc: TextureDesc) -> MockHandle {
        self.make(label, Some(desc), None, None)
    }

    pub fn create_host_sampler(&self, label: &str, desc: SamplerDesc) -> MockHandle {
        self.make(label, None, Some(desc), None)
    }

    pub fn create_render_target(&self, info: RenderTargetInfo) -> MockHandle {
        self.make("render target", None, None, Some(info))
    }

    pub fn set_context_lost(&self, lost: bool) {
        self.0.borrow_mut().context_lost = lost;
    }

    pub fn set_fail_creation(&self, fail: bool) {
        self.0.borrow_mut().fail_creation = fail;
    }

    pub fn created(&self) -> Vec<String> {
        self.0.borrow().created.clone()
    }

    pub fn created_count(&self, label_prefix: &str) -> usize {
        self.0
            .borrow()
            .created
            .iter()
            .filter(|label| label.starts_with(label_prefix))
            .count()
    }

    pub fn dispatches(&self) -> Vec<(String, [u32; 3])> {
        self.0
            .borrow()
            .log
            .iter()
            .filter_map(|call| match call {
                Call::Dispatch(shader, groups) => Some((shader.clone(), *groups)),
                _ => None,
            })
            .collect()
    }

    pub fn uploads(&self) -> Vec<(String, Vec<u8>)> {
        self.0.borrow().uploads.clone()
    }

    pub fn last_upload(&self) -> Option<Vec<u8>> {
        self.0.borrow().uploads.last().map(|(_, data)| data.clone())
    }

    pub fn attached_injectors(&self) -> usize {
        self.0.borrow().injectors.len()
    }
}

pub struct MockContext(Rc<RefCell<MockState>>);

impl MockContext {
    pub fn bindings(&self) -> Bindings {
        self.0.borrow().bindings.clone()
    }

    pub fn log(&self) -> Vec<Call> {
        self.0.borrow().log.clone()
    }

    pub fn clear_log(&self) {
        self.0.borrow_mut().log.clear();
    }

    fn injectors(&self) -> Vec<Arc<DeviceInjector<Mock>>> {
        self.0.borrow().injectors.clone()
    }

    fn push(&self, call: Call) {
        self.0.borrow_mut().log.push(call);
    }

    /// Sampler binding as issued by the host application, routed through the attached injectors.
    pub fn host_set_ps_samplers(&self, start_slot: u32, samplers: &[Option<MockHandle>]) {
        for injector in self.injectors() {
            if injector.pre_ps_set_samplers(start_slot, samplers) {
                return;
            }
        }
        self.set_ps_samplers(start_slot, samplers);
    }

    /// Render target binding as issued by the host application.
    pub fn host_set_render_targets(
        &self,
        views: &[Option<MockHandle>],
        depth_stencil: Option<&MockHandle>,
    ) {
        self.set_render_targets(views, depth_stencil);
        for injector in self.injectors() {
            injector.post_om_set_render_targets(views, depth_stencil);
        }
    }
}

fn set_range<T: Clone>(slots: &mut [Option<T>], start_slot: u32, values: &[Option<T>]) {
    for (slot, value) in slots.iter_mut().skip(start_slot as usize).zip(values) {
        *slot = value.clone();
    }
}

impl Backend for Mock {
    type Device = MockDevice;
    type Context = MockContext;
    type Texture = MockHandle;
    type ShaderResourceView = MockHandle;
    type UnorderedAccessView = MockHandle;
    type RenderTargetView = MockHandle;
    type DepthStencilView = MockHandle;
    type Buffer = MockHandle;
    type VertexShader = MockHandle;
    type PixelShader = MockHandle;
    type ComputeShader = MockHandle;
    type InputLayout = MockHandle;
    type RasterizerState = MockHandle;
    type DepthStencilState = MockHandle;
    type SamplerState = MockHandle;
    type Query = MockHandle;

    unsafe fn texture_from_raw(handle: *mut c_void) -> Option<MockHandle> {
        if handle.is_null() {
            return None;
        }
        let object = handle as *const MockObject;
        Rc::increment_strong_count(object);
        Some(MockHandle(Rc::from_raw(object)))
    }

    fn texture_as_raw(texture: &MockHandle) -> *mut c_void {
        Rc::as_ptr(&texture.0) as _
    }

    fn texture_desc(texture: &MockHandle) -> TextureDesc {
        texture.0.texture.expect("not a texture")
    }

    fn texture_device(texture: &MockHandle) -> StrResult<MockDevice> {
        Ok(texture.0.device.clone())
    }

    fn sampler_desc(sampler: &MockHandle) -> SamplerDesc {
        sampler.0.sampler.expect("not a sampler")
    }

    fn render_target_info(view: &MockHandle) -> RenderTargetInfo {
        view.0.render_target.expect("not a render target")
    }
}

impl Device<Mock> for MockDevice {
    fn immediate_context(&self) -> StrResult<MockContext> {
        if self.0.borrow().context_lost {
            return Err("No immediate context".into());
        }
        Ok(MockContext(self.0.clone()))
    }

    fn create_texture(
        &self,
        desc: &TextureDesc,
        initial_data: Option<InitialData>,
    ) -> StrResult<MockHandle> {
        if let Some(data) = initial_data {
            let expected = data.row_pitch as usize * desc.height as usize;
            if data.bytes.len() < expected {
                return Err(format!("initial data too small: {}", data.bytes.len()));
            }
        }
        self.create(
            &format!("texture {}x{}x{}", desc.width, desc.height, desc.array_size),
            Some(*desc),
            None,
        )
    }

    fn create_shader_resource_view(
        &self,
        texture: &MockHandle,
        _: Format,
        array_slice: Option<u32>,
    ) -> StrResult<MockHandle> {
        self.create(
            &format!("srv {} {:?}", texture.label(), array_slice),
            None,
            None,
        )
    }

    fn create_unordered_access_view(
        &self,
        texture: &MockHandle,
        _: Format,
        array_slice: Option<u32>,
    ) -> StrResult<MockHandle> {
        self.create(
            &format!("uav {} {:?}", texture.label(), array_slice),
            None,
            None,
        )
    }

    fn create_constant_buffer(&self, size: u32) -> StrResult<MockHandle> {
        self.create(&format!("constant buffer {}", size), None, None)
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> StrResult<MockHandle> {
        self.create("sampler", None, Some(*desc))
    }

    fn create_compute_shader(&self, bytecode: &[u8]) -> StrResult<MockHandle> {
        self.create(&String::from_utf8_lossy(bytecode), None, None)
    }

    fn create_query(&self, kind: QueryKind) -> StrResult<MockHandle> {
        self.create(&format!("query {:?}", kind), None, None)
    }

    fn attach_injector(&self, injector: &Arc<DeviceInjector<Mock>>) -> StrResult {
        let mut state = self.0.borrow_mut();
        if !state.injectors.iter().any(|i| Arc::ptr_eq(i, injector)) {
            state.injectors.push(injector.clone());
        }
        Ok(())
    }

    fn detach_injector(&self, injector: &Arc<DeviceInjector<Mock>>) {
        self.0
            .borrow_mut()
            .injectors
            .retain(|i| !Arc::ptr_eq(i, injector));
    }
}

impl DeviceContext<Mock> for MockContext {
    fn vertex_shader(&self) -> Option<MockHandle> {
        self.0.borrow().bindings.vertex_shader.clone()
    }

    fn set_vertex_shader(&self, shader: Option<&MockHandle>) {
        self.0.borrow_mut().bindings.vertex_shader = shader.cloned();
    }

    fn pixel_shader(&self) -> Option<MockHandle> {
        self.0.borrow().bindings.pixel_shader.clone()
    }

    fn set_pixel_shader(&self, shader: Option<&MockHandle>) {
        self.0.borrow_mut().bindings.pixel_shader = shader.cloned();
    }

    fn compute_shader(&self) -> Option<MockHandle> {
        self.0.borrow().bindings.compute_shader.clone()
    }

    fn set_compute_shader(&self, shader: Option<&MockHandle>) {
        self.0.borrow_mut().bindings.compute_shader = shader.cloned();
    }

    fn input_layout(&self) -> Option<MockHandle> {
        self.0.borrow().bindings.input_layout.clone()
    }

    fn set_input_layout(&self, layout: Option<&MockHandle>) {
        self.0.borrow_mut().bindings.input_layout = layout.cloned();
    }

    fn primitive_topology(&self) -> u32 {
        self.0.borrow().bindings.topology
    }

    fn set_primitive_topology(&self, topology: u32) {
        self.0.borrow_mut().bindings.topology = topology;
    }

    fn vertex_buffers(&self) -> Vec<VertexBufferBinding<Mock>> {
        self.0.borrow().bindings.vertex_buffers.clone()
    }

    fn set_vertex_buffers(&self, bindings: &[VertexBufferBinding<Mock>]) {
        let mut state = self.0.borrow_mut();
        for (slot, binding) in state.bindings.vertex_buffers.iter_mut().zip(bindings) {
            *slot = binding.clone();
        }
    }

    fn index_buffer(&self) -> IndexBufferBinding<Mock> {
        self.0.borrow().bindings.index_buffer.clone()
    }

    fn set_index_buffer(&self, binding: &IndexBufferBinding<Mock>) {
        self.0.borrow_mut().bindings.index_buffer = binding.clone();
    }

    fn render_targets(&self) -> (Vec<Option<MockHandle>>, Option<MockHandle>) {
        let state = self.0.borrow();
        (
            state.bindings.render_targets.clone(),
            state.bindings.depth_stencil_view.clone(),
        )
    }

    fn set_render_targets(&self, views: &[Option<MockHandle>], depth_stencil: Option<&MockHandle>) {
        {
            let mut state = self.0.borrow_mut();
            state.bindings.render_targets = vec![None; RENDER_TARGET_SLOTS];
            set_range(&mut state.bindings.render_targets, 0, views);
            state.bindings.depth_stencil_view = depth_stencil.cloned();
        }
        self.push(Call::SetRenderTargets(views.len()));
    }

    fn rasterizer_state(&self) -> Option<MockHandle> {
        self.0.borrow().bindings.rasterizer_state.clone()
    }

    fn set_rasterizer_state(&self, state: Option<&MockHandle>) {
        self.0.borrow_mut().bindings.rasterizer_state = state.cloned();
    }

    fn depth_stencil_state(&self) -> (Option<MockHandle>, u32) {
        let state = self.0.borrow();
        (
            state.bindings.depth_stencil_state.clone(),
            state.bindings.stencil_ref,
        )
    }

    fn set_depth_stencil_state(&self, depth_stencil: Option<&MockHandle>, stencil_ref: u32) {
        let mut state = self.0.borrow_mut();
        state.bindings.depth_stencil_state = depth_stencil.cloned();
        state.bindings.stencil_ref = stencil_ref;
    }

    fn viewports(&self) -> Vec<NativeViewport> {
        self.0.borrow().bindings.viewports.clone()
    }

    fn set_viewports(&self, viewports: &[NativeViewport]) {
        self.0.borrow_mut().bindings.viewports = viewports.to_vec();
    }

    fn constant_buffer(&self, stage: ShaderStage) -> Option<MockHandle> {
        self.0.borrow().bindings.constant_buffers[stage as usize].clone()
    }

    fn set_constant_buffer(&self, stage: ShaderStage, buffer: Option<&MockHandle>) {
        self.0.borrow_mut().bindings.constant_buffers[stage as usize] = buffer.cloned();
    }

    fn cs_shader_resources(&self) -> Vec<Option<MockHandle>> {
        self.0.borrow().bindings.cs_shader_resources.clone()
    }

    fn set_cs_shader_resources(&self, start_slot: u32, views: &[Option<MockHandle>]) {
        let mut state = self.0.borrow_mut();
        set_range(&mut state.bindings.cs_shader_resources, start_slot, views);
    }

    fn cs_unordered_access_views(&self) -> Vec<Option<MockHandle>> {
        self.0.borrow().bindings.cs_unordered_access_views.clone()
    }

    fn set_cs_unordered_access_views(&self, start_slot: u32, views: &[Option<MockHandle>]) {
        let mut state = self.0.borrow_mut();
        set_range(&mut state.bindings.cs_unordered_access_views, start_slot, views);
    }

    fn set_cs_samplers(&self, start_slot: u32, samplers: &[Option<MockHandle>]) {
        let mut state = self.0.borrow_mut();
        set_range(&mut state.bindings.cs_samplers, start_slot, samplers);
    }

    fn set_ps_samplers(&self, start_slot: u32, samplers: &[Option<MockHandle>]) {
        {
            let mut state = self.0.borrow_mut();
            set_range(&mut state.bindings.ps_samplers, start_slot, samplers);
        }
        self.push(Call::SetPsSamplers(start_slot, samplers.len()));
    }

    fn update_buffer(&self, buffer: &MockHandle, data: &[u8]) {
        let mut state = self.0.borrow_mut();
        state.uploads.push((buffer.label().to_owned(), data.to_vec()));
        state.log.push(Call::UpdateBuffer(buffer.label().to_owned()));
    }

    fn update_texture(&self, texture: &MockHandle, subresource: u32, data: &[u8], _: u32) {
        let mut state = self.0.borrow_mut();
        state.uploads.push((texture.label().to_owned(), data.to_vec()));
        state
            .log
            .push(Call::UpdateTexture(texture.label().to_owned(), subresource));
    }

    fn copy_subresource_region(
        &self,
        destination: &MockHandle,
        _: u32,
        source: &MockHandle,
        _: u32,
        _: u32,
        _: u32,
    ) {
        self.push(Call::Copy(
            destination.label().to_owned(),
            source.label().to_owned(),
        ));
    }

    fn resolve_subresource(
        &self,
        destination: &MockHandle,
        _: u32,
        source: &MockHandle,
        _: u32,
        _: Format,
    ) {
        self.push(Call::Resolve(
            destination.label().to_owned(),
            source.label().to_owned(),
        ));
    }

    fn dispatch(&self, groups_x: u32, groups_y: u32, groups_z: u32) {
        let shader = self
            .compute_shader()
            .map(|shader| shader.label().to_owned())
            .unwrap_or_default();
        self.push(Call::Dispatch(shader, [groups_x, groups_y, groups_z]));
    }

    fn begin_query(&self, _: &MockHandle) {}

    // Every timestamp is 1000 ticks after the previous one.
    fn end_query(&self, query: &MockHandle) {
        if query.label().ends_with("Timestamp") {
            let mut state = self.0.borrow_mut();
            state.clock += 1000;
            let clock = state.clock;
            state.timestamps.insert(query.clone(), clock);
        }
    }

    fn timestamp(&self, query: &MockHandle) -> Option<u64> {
        self.0.borrow().timestamps.get(query).copied()
    }

    fn timestamp_disjoint(&self, _: &MockHandle) -> Option<TimestampDisjoint> {
        Some(TimestampDisjoint {
            frequency: 1_000_000,
            disjoint: false,
        })
    }
}
