//! Running compiled plans.
//!
//! A plan is loaded by [`CompiledPlan`], its tensors are resolved by name
//! ([`resolve`]) and backed by device buffers ([`BufferTable`]). Images are
//! decoded into a planar [`HostInputBatch`], and an [`InferenceSession`] ties
//! the stages together and owns every resource they acquire.

mod binding;
mod buffers;
mod loader;
mod preprocess;
mod session;

pub use binding::{resolve, ResolvedBinding, TensorNames};
pub use buffers::{BufferSlot, BufferTable};
pub use loader::CompiledPlan;
pub use preprocess::{fill, planar_offset, ChannelOrder, HostInputBatch};
pub use session::{InferenceResult, InferenceSession, SessionState, TensorData};
