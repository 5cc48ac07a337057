//! What the sink needs from the runtime host.

use std::sync::Arc;
use std::time::Duration;

use clrscope_common::{
    AssemblyId, ClassId, EventInterest, Guid, HResult, ModuleId, ObjectId, TypeToken,
};

/// Info capability the sink keeps between initialize and shutdown
pub trait ProfilerInfo: Send + Sync {
    /// # Errors
    /// Returns the host status when the mask is refused
    fn set_event_mask(&self, mask: EventInterest) -> Result<(), HResult>;

    /// Owning module and type-definition token of a loaded class
    ///
    /// # Errors
    /// Returns the host status when the class is unknown
    fn class_id_info(&self, class: ClassId) -> Result<(ModuleId, TypeToken), HResult>;

    /// # Errors
    /// Returns the host status when the object is unknown
    fn class_from_object(&self, object: ObjectId) -> Result<ClassId, HResult>;

    /// # Errors
    /// Returns the host status when the assembly is unknown
    fn assembly_name(&self, assembly: AssemblyId) -> Result<String, HResult>;

    /// Ask the host to unload the sink once no callback is running. The host
    /// confirms with `ProfilerDetachSucceeded`.
    ///
    /// # Errors
    /// Returns the host status when detach is refused
    fn request_detach(&self, expected_completion: Duration) -> Result<(), HResult>;
}

/// Object handed to `initialize`/`initialize_for_attach`, queried for the info capability
pub trait HostInfoProvider: Send + Sync {
    /// # Errors
    /// `E_NOINTERFACE` when the host does not expose `iid`
    fn query_info(&self, iid: Guid) -> Result<Arc<dyn ProfilerInfo>, HResult>;
}
