//! Prefix-sum execution over typed views

use crate::context::DeviceContext;
use crate::driver::{DevicePtr, Driver};
use crate::view::TypedBufferView;
use crate::{Error, Result};
use tracing::{debug, info, warn};

/// When a completion barrier follows a launch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncPolicy {
    /// Barrier after every launch.
    #[default]
    Hardened,
    /// Barrier after in-place launches only. Two-buffer launches return
    /// [`Completion::Pending`]; the barrier is deferred until the first of
    /// the mappings involved is released.
    Faithful,
}

/// Device-side state of the results when an operation returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// A barrier was issued; results are fully written.
    Synchronized,
    /// No barrier was issued; whoever reads the output next must not assume
    /// the kernel has finished.
    Pending,
}

impl Completion {
    pub fn is_synchronized(&self) -> bool {
        matches!(self, Completion::Synchronized)
    }
}

/// Runs prefix sums on views that belong to one device context.
pub struct OperationExecutor<'a, D: Driver> {
    ctx: &'a DeviceContext<D>,
    policy: SyncPolicy,
}

impl<'a, D: Driver> OperationExecutor<'a, D> {
    pub fn new(ctx: &'a DeviceContext<D>, policy: SyncPolicy) -> Self {
        Self { ctx, policy }
    }

    pub fn policy(&self) -> SyncPolicy {
        self.policy
    }

    /// Overwrite `view` with its inclusive prefix sum.
    ///
    /// Always ends with a barrier: nothing in this process reads the result
    /// back, so without it the process could exit before the kernel runs.
    pub fn cumsum_in_place(&self, view: &mut TypedBufferView<D>) -> Result<Completion> {
        self.check_view(view)?;

        let ptr = view.device_ptr();
        self.launch(view, ptr, ptr)?;
        self.ctx.synchronize()?;

        info!(len = view.len(), dtype = %view.dtype(), "in-place cumsum complete");
        Ok(Completion::Synchronized)
    }

    /// Write the inclusive prefix sum of `input` into `output`.
    ///
    /// `input` is only read. Under [`SyncPolicy::Faithful`] no barrier is
    /// issued and the result is [`Completion::Pending`]. The views must not be
    /// read until one of them (or the context) has been synchronized.
    pub fn cumsum_into(
        &self,
        input: &TypedBufferView<D>,
        output: &mut TypedBufferView<D>,
    ) -> Result<Completion> {
        self.check_view(input)?;
        self.check_view(output)?;
        if input.dtype() != output.dtype() {
            return Err(Error::TypeMismatch {
                expected: input.dtype().to_string(),
                actual: output.dtype().to_string(),
            });
        }
        if input.len() != output.len() {
            return Err(Error::InvalidShape(format!(
                "input has {} elements, output has {}",
                input.len(),
                output.len()
            )));
        }

        self.launch(input, input.device_ptr(), output.device_ptr())?;

        match self.policy {
            SyncPolicy::Hardened => {
                self.ctx.synchronize()?;
                info!(len = input.len(), dtype = %input.dtype(), "cumsum into output complete");
                Ok(Completion::Synchronized)
            }
            SyncPolicy::Faithful => {
                warn!(
                    len = input.len(),
                    "cumsum into output launched without a barrier; completion is not guaranteed"
                );
                Ok(Completion::Pending)
            }
        }
    }

    fn check_view(&self, view: &TypedBufferView<D>) -> Result<()> {
        if !view.context().same_context(self.ctx) {
            return Err(Error::ContextMismatch);
        }
        if !view.dtype().supports_cumsum() {
            return Err(Error::Compute {
                message: format!("no cumsum kernel for {:?}", view.dtype()),
                source: None,
            });
        }
        Ok(())
    }

    fn launch(&self, like: &TypedBufferView<D>, src: DevicePtr, dst: DevicePtr) -> Result<()> {
        debug!(
            src = format_args!("{:#x}", src),
            dst = format_args!("{:#x}", dst),
            len = like.len(),
            "launching cumsum"
        );
        self.ctx
            .driver()
            .launch_cumsum(self.ctx.raw(), like.dtype(), src, dst, like.len())
            .map_err(|e| Error::compute("cumsum launch failed", e))?;
        self.ctx.mark_pending();
        Ok(())
    }
}
