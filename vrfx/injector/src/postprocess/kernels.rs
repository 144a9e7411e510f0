use log::*;
use std::{collections::HashMap, fs, path::Path};
use vrfx_common::*;

const TRACE_CONTEXT: &str = "Kernels";

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Kernel {
    FsrEasu,
    FsrRcas,
    CasUpscale,
    CasSharpen,
    NisUpscale,
    NisSharpen,
}

impl Kernel {
    pub const ALL: [Kernel; 6] = [
        Kernel::FsrEasu,
        Kernel::FsrRcas,
        Kernel::CasUpscale,
        Kernel::CasSharpen,
        Kernel::NisUpscale,
        Kernel::NisSharpen,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Kernel::FsrEasu => "fsr_easu",
            Kernel::FsrRcas => "fsr_rcas",
            Kernel::CasUpscale => "cas_upscale",
            Kernel::CasSharpen => "cas_sharpen",
            Kernel::NisUpscale => "nis_upscale",
            Kernel::NisSharpen => "nis_sharpen",
        }
    }
}

/// Provider of precompiled compute kernel bytecode.
pub trait KernelSource: Send + Sync {
    fn bytecode(&self, kernel: Kernel) -> StrResult<Vec<u8>>;
}

/// Kernels compiled to `<dir>/<name>.cso`. Every file is read once, up front, so that building
/// upscaler resources never touches the disk.
pub struct KernelDirectory {
    kernels: HashMap<Kernel, Vec<u8>>,
}

impl KernelDirectory {
    pub fn load(dir: &Path) -> Self {
        let mut kernels = HashMap::new();
        for &kernel in Kernel::ALL.iter() {
            let path = dir.join(format!("{}.cso", kernel.name()));
            match fs::read(&path) {
                Ok(bytecode) => {
                    kernels.insert(kernel, bytecode);
                }
                Err(e) => warn!("Cannot read kernel {}: {}", path.display(), e),
            }
        }
        Self { kernels }
    }
}

impl KernelSource for KernelDirectory {
    fn bytecode(&self, kernel: Kernel) -> StrResult<Vec<u8>> {
        Ok(trace_none!(self.kernels.get(&kernel), "Kernel {} not loaded", kernel.name())?.clone())
    }
}

/// Kernel source whose bytecode is the kernel name, so the mock backend labels shaders by name.
#[cfg(test)]
pub struct KernelNames;

#[cfg(test)]
impl KernelSource for KernelNames {
    fn bytecode(&self, kernel: Kernel) -> StrResult<Vec<u8>> {
        Ok(kernel.name().as_bytes().to_vec())
    }
}
