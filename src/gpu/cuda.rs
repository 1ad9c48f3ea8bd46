//! CUDA implementation of [`ComputeBackend`] on top of cudarc.
//!
//! Kernels are compiled at runtime with NVRTC and loaded one module per
//! entry point. Scalars travel in two small device buffers uploaded per
//! launch, so every kernel launch is a fixed-arity tuple of device pointers
//! regardless of how many scalars the kernel consumes.

use std::sync::Arc;

use cudarc::driver::sys::CUdevice_attribute;
use cudarc::driver::{CudaDevice, CudaFunction, CudaSlice, DriverError, LaunchAsync, LaunchConfig};
use cudarc::nvrtc::compile_ptx;
use tracing::{debug, info};

use crate::cnn::kernels::KERNEL_ROSTER;
use crate::error::{Result, SrcnnError};
use crate::gpu::backend::{
    BackendBuf, BackendKernel, ComputeBackend, DeviceLimits, KernelLimits, LaunchRequest,
};

fn driver_err(context: &str, e: DriverError) -> SrcnnError {
    SrcnnError::Device(format!("{context}: {e:?}"))
}

/// One CUDA device with its default (in-order) stream.
pub struct CudaBackend {
    device: Arc<CudaDevice>,
    limits: DeviceLimits,
    buffers: Vec<Option<CudaSlice<u8>>>,
    kernels: Vec<CudaFunction>,
}

impl CudaBackend {
    /// Opens ordinal 0 and caches its limits.
    pub fn new() -> Result<Self> {
        let device = CudaDevice::new(0).map_err(|e| driver_err("no usable CUDA device", e))?;

        let attr = |a: CUdevice_attribute| -> Result<usize> {
            let v = device
                .attribute(a)
                .map_err(|e| driver_err("device attribute query failed", e))?;
            Ok(v as usize)
        };
        let limits = DeviceLimits {
            name: device
                .name()
                .map_err(|e| driver_err("device name query failed", e))?,
            max_work_group_size: attr(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK)?,
            max_work_item_sizes: [
                attr(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_X)?,
                attr(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_Y)?,
                attr(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_Z)?,
            ],
            local_mem_bytes: attr(
                CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_SHARED_MEMORY_PER_BLOCK,
            )?,
            max_global_work_items: attr(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_X)?
                .saturating_mul(attr(
                    CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK,
                )?),
        };
        info!(device = %limits.name, "opened CUDA device");

        Ok(CudaBackend {
            device,
            limits,
            buffers: Vec::new(),
            kernels: Vec::new(),
        })
    }

    fn buf(&self, b: BackendBuf) -> Result<&CudaSlice<u8>> {
        self.buffers
            .get(b.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| SrcnnError::Device(format!("device buffer {} is not live", b.0)))
    }

    fn buf_mut(&mut self, b: BackendBuf) -> Result<&mut CudaSlice<u8>> {
        self.buffers
            .get_mut(b.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| SrcnnError::Device(format!("device buffer {} is not live", b.0)))
    }
}

impl ComputeBackend for CudaBackend {
    fn name(&self) -> &'static str {
        "cuda"
    }

    fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    fn alloc(&mut self, byte_size: usize) -> Result<BackendBuf> {
        let slice = self
            .device
            .alloc_zeros::<u8>(byte_size.max(1))
            .map_err(|e| driver_err("device allocation failed", e))?;
        self.buffers.push(Some(slice));
        Ok(BackendBuf(self.buffers.len() - 1))
    }

    fn free(&mut self, buf: BackendBuf) -> Result<()> {
        let slot = self
            .buffers
            .get_mut(buf.0)
            .ok_or_else(|| SrcnnError::Device(format!("device buffer {} is not live", buf.0)))?;
        if slot.take().is_none() {
            return Err(SrcnnError::Device(format!(
                "device buffer {} is not live",
                buf.0
            )));
        }
        Ok(())
    }

    fn write(&mut self, buf: BackendBuf, byte_offset: usize, data: &[u8]) -> Result<()> {
        let device = self.device.clone();
        let slice = self.buf_mut(buf)?;
        let mut view = slice
            .try_slice_mut(byte_offset..byte_offset + data.len())
            .ok_or_else(|| {
                SrcnnError::SizeMismatch(format!(
                    "write range {}..{} exceeds device buffer",
                    byte_offset,
                    byte_offset + data.len()
                ))
            })?;
        device
            .htod_sync_copy_into(data, &mut view)
            .map_err(|e| driver_err("host-to-device copy failed", e))
    }

    fn read(&mut self, buf: BackendBuf, byte_offset: usize, out: &mut [u8]) -> Result<()> {
        let device = self.device.clone();
        let slice = self.buf(buf)?;
        let view = slice
            .try_slice(byte_offset..byte_offset + out.len())
            .ok_or_else(|| {
                SrcnnError::SizeMismatch(format!(
                    "read range {}..{} exceeds device buffer",
                    byte_offset,
                    byte_offset + out.len()
                ))
            })?;
        device
            .dtoh_sync_copy_into(&view, out)
            .map_err(|e| driver_err("device-to-host copy failed", e))
    }

    fn compile(&mut self, source: &str, options: &str, entry: &str) -> Result<BackendKernel> {
        // load_ptx wants 'static entry names; resolve through the roster.
        let entry_static = KERNEL_ROSTER
            .iter()
            .find(|(name, _)| *name == entry)
            .map(|(name, _)| *name)
            .ok_or_else(|| SrcnnError::Device(format!("unknown entry point '{entry}'")))?;

        let ptx = compile_ptx(source).map_err(|e| {
            SrcnnError::Device(format!("nvrtc build failed for '{entry}': {e:?}"))
        })?;
        if !options.is_empty() {
            debug!(entry, options, "build options ignored; sources carry no tunables");
        }
        self.device
            .load_ptx(ptx, entry_static, &[entry_static])
            .map_err(|e| driver_err("module load failed", e))?;
        let func = self
            .device
            .get_func(entry_static, entry_static)
            .ok_or_else(|| {
                SrcnnError::Device(format!("entry point '{entry}' missing from loaded module"))
            })?;
        debug!(entry, "compiled and loaded kernel");
        self.kernels.push(func);
        Ok(BackendKernel(self.kernels.len() - 1))
    }

    fn kernel_limits(&self, _kernel: BackendKernel) -> KernelLimits {
        KernelLimits {
            max_work_group_size: self.limits.max_work_group_size,
            private_mem_bytes: 0,
        }
    }

    fn launch(&mut self, req: &LaunchRequest<'_>) -> Result<()> {
        let func = self
            .kernels
            .get(req.kernel.0)
            .ok_or_else(|| SrcnnError::Device(format!("kernel {} not found", req.kernel.0)))?
            .clone();

        // The scalar buffers are tiny and uploaded fresh each launch; an
        // empty pack still gets one element so the pointer is always valid.
        let mut shape = req.shape.to_vec();
        if shape.is_empty() {
            shape.push(0);
        }
        let mut params = req.params.to_vec();
        if params.is_empty() {
            params.push(0.0);
        }
        let shape_dev = self
            .device
            .htod_sync_copy(&shape)
            .map_err(|e| driver_err("shape upload failed", e))?;
        let params_dev = self
            .device
            .htod_sync_copy(&params)
            .map_err(|e| driver_err("params upload failed", e))?;

        let cfg = LaunchConfig {
            grid_dim: (
                (req.global[0] / req.local[0]) as u32,
                (req.global[1] / req.local[1]) as u32,
                (req.global[2] / req.local[2]) as u32,
            ),
            block_dim: (
                req.local[0] as u32,
                req.local[1] as u32,
                req.local[2] as u32,
            ),
            shared_mem_bytes: req.local_mem_bytes as u32,
        };

        let r = match req.bufs {
            [a] => {
                let a = self.buf(*a)?;
                unsafe { func.launch(cfg, (a, &shape_dev, &params_dev)) }
            }
            [a, b] => {
                let (a, b) = (self.buf(*a)?, self.buf(*b)?);
                unsafe { func.launch(cfg, (a, b, &shape_dev, &params_dev)) }
            }
            [a, b, c] => {
                let (a, b, c) = (self.buf(*a)?, self.buf(*b)?, self.buf(*c)?);
                unsafe { func.launch(cfg, (a, b, c, &shape_dev, &params_dev)) }
            }
            [a, b, c, d] => {
                let (a, b, c, d) = (
                    self.buf(*a)?,
                    self.buf(*b)?,
                    self.buf(*c)?,
                    self.buf(*d)?,
                );
                unsafe { func.launch(cfg, (a, b, c, d, &shape_dev, &params_dev)) }
            }
            other => {
                return Err(SrcnnError::DispatchValidation(format!(
                    "unsupported buffer argument count {}",
                    other.len()
                )))
            }
        };
        r.map_err(|e| driver_err("kernel launch failed", e))
    }

    fn synchronize(&mut self) -> Result<()> {
        self.device
            .synchronize()
            .map_err(|e| driver_err("device synchronize failed", e))
    }
}
