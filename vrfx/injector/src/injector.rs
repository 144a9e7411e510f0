use crate::graphics::*;
use parking_lot::Mutex;
use std::sync::Arc;

/// Observer of the device context calls intercepted for a device.
pub trait RenderListener<B: Backend> {
    /// Return true if the listener bound the samplers itself and the host call must be skipped.
    fn pre_ps_set_samplers(&mut self, _start_slot: u32, _samplers: &[Option<B::SamplerState>]) -> bool {
        false
    }

    fn post_om_set_render_targets(
        &mut self,
        _views: &[Option<B::RenderTargetView>],
        _depth_stencil: Option<&B::DepthStencilView>,
    ) {
    }
}

pub type SharedListener<B> = Arc<Mutex<dyn RenderListener<B>>>;

pub struct DeviceInjector<B: Backend> {
    listeners: Mutex<Vec<SharedListener<B>>>,
}

impl<B: Backend> Default for DeviceInjector<B> {
    fn default() -> Self {
        Self {
            listeners: Mutex::new(vec![]),
        }
    }
}

impl<B: Backend> DeviceInjector<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: SharedListener<B>) {
        let mut listeners = self.listeners.lock();
        if !listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            listeners.push(listener);
        }
    }

    pub fn remove_listener(&self, listener: &SharedListener<B>) {
        self.listeners.lock().retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    // Listeners are invoked on a copy of the list, they are free to call back into the injector.
    fn listeners(&self) -> Vec<SharedListener<B>> {
        self.listeners.lock().clone()
    }

    pub fn pre_ps_set_samplers(&self, start_slot: u32, samplers: &[Option<B::SamplerState>]) -> bool {
        self.listeners()
            .iter()
            .any(|listener| listener.lock().pre_ps_set_samplers(start_slot, samplers))
    }

    pub fn post_om_set_render_targets(
        &self,
        views: &[Option<B::RenderTargetView>],
        depth_stencil: Option<&B::DepthStencilView>,
    ) {
        for listener in self.listeners() {
            listener
                .lock()
                .post_om_set_render_targets(views, depth_stencil);
        }
    }
}
