//! Services the transfer engines are built from.
//!
//! Policy and capability are process-wide by default, but every engine reaches
//! them through the [`GdsRuntime`] it was given rather than through globals, so
//! tests and embedders can substitute their own.

use std::sync::Arc;

use crate::backend::policy::BackendPolicy;
use crate::backend::shim::CapabilityShim;
use crate::config::TransferConfig;
use crate::gpu::allocator::DeviceAllocator;
use crate::gpu::device::{cuda_runtime, DeviceContext, HostDeviceContext};
use crate::metrics::TransferMetrics;
use crate::transfer::error::TransferError;

#[derive(Clone)]
pub struct GdsRuntime {
    policy: Arc<BackendPolicy>,
    shim: Arc<CapabilityShim>,
    device: Arc<dyn DeviceContext>,
    allocator: DeviceAllocator,
    config: Arc<TransferConfig>,
    metrics: Arc<TransferMetrics>,
}

impl GdsRuntime {
    pub fn builder() -> GdsRuntimeBuilder {
        GdsRuntimeBuilder::default()
    }

    /// Process-wide policy and libcufile shim, CUDA memory when available.
    pub fn global() -> Result<Self, TransferError> {
        Self::builder().build()
    }

    pub fn policy(&self) -> &BackendPolicy {
        &self.policy
    }

    pub fn shim(&self) -> &CapabilityShim {
        &self.shim
    }

    pub fn device(&self) -> &Arc<dyn DeviceContext> {
        &self.device
    }

    pub fn allocator(&self) -> &DeviceAllocator {
        &self.allocator
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<TransferMetrics> {
        &self.metrics
    }
}

#[derive(Default)]
pub struct GdsRuntimeBuilder {
    policy: Option<Arc<BackendPolicy>>,
    shim: Option<Arc<CapabilityShim>>,
    device: Option<Arc<dyn DeviceContext>>,
    allocator: Option<DeviceAllocator>,
    config: TransferConfig,
    metrics: Option<Arc<TransferMetrics>>,
}

impl GdsRuntimeBuilder {
    pub fn policy(mut self, policy: Arc<BackendPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn shim(mut self, shim: Arc<CapabilityShim>) -> Self {
        self.shim = Some(shim);
        self
    }

    pub fn device(mut self, device: Arc<dyn DeviceContext>) -> Self {
        self.device = Some(device);
        self
    }

    pub fn allocator(mut self, allocator: DeviceAllocator) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Host memory and per-thread host device ids, regardless of CUDA.
    pub fn host_memory(self) -> Self {
        self.device(Arc::new(HostDeviceContext))
            .allocator(DeviceAllocator::host())
    }

    pub fn config(mut self, config: TransferConfig) -> Self {
        self.config = config;
        self
    }

    pub fn metrics(mut self, metrics: Arc<TransferMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<GdsRuntime, TransferError> {
        let (device, allocator) = match (self.device, self.allocator) {
            (Some(device), Some(allocator)) => (device, allocator),
            (device, allocator) => {
                let cuda = cuda_runtime();
                let device = device.unwrap_or_else(|| match &cuda {
                    Some(runtime) => runtime.clone() as Arc<dyn DeviceContext>,
                    None => Arc::new(HostDeviceContext),
                });
                let allocator = allocator.unwrap_or_else(|| match cuda {
                    Some(runtime) => DeviceAllocator::new(runtime),
                    None => DeviceAllocator::host(),
                });
                (device, allocator)
            }
        };

        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(TransferMetrics::new()?),
        };

        Ok(GdsRuntime {
            policy: self.policy.unwrap_or_else(BackendPolicy::global),
            shim: self.shim.unwrap_or_else(CapabilityShim::global),
            device,
            allocator,
            config: Arc::new(self.config),
            metrics,
        })
    }
}
