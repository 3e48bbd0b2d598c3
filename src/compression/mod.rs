mod kernel;
mod sparse;
mod sparsifier;

pub use kernel::{DropKernel, ResidualDrop, TopKDrop, retained};
pub use sparse::{SparseDelta, SparseView};
pub use sparsifier::{GradientSparsifier, capacity_for};

use crate::config::DropKernelSpec;

/// Resolves a `DropKernel` from its specification.
///
/// # Arguments
/// * `spec` - The kernel's specification.
/// * `len` - The length of the buffers the kernel will compress.
pub fn build_kernel(spec: DropKernelSpec, len: usize) -> Box<dyn DropKernel + Send> {
    match spec {
        DropKernelSpec::TopK => Box::new(TopKDrop::new()),
        DropKernelSpec::Residual => Box::new(ResidualDrop::new(len)),
    }
}
