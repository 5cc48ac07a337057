//! Class-factory entry point the host uses to instantiate the sink.
//!
//! The host first asks for the factory of a component id, then asks the
//! factory for an instance exposing one callback interface.

use clrscope_common::{iid, Guid, HResult, SINK_COMPONENT_ID};
use log::debug;

use super::{identity, EventSink, InterfaceRef, SinkServices};
use crate::domain::SinkError;

/// Factory for the sink component.
///
/// The factory is not reference counted; it lives as long as the host keeps it.
pub struct SinkFactory {
    services: SinkServices,
}

/// Hand out the factory for `clsid`, exposed as `iid`
///
/// # Errors
/// `CLASS_E_CLASSNOTAVAILABLE` for any component other than the sink,
/// `E_NOINTERFACE` unless `iid` is `IUnknown` or `IClassFactory`
pub fn get_class_object(
    clsid: Guid,
    iid: Guid,
    services: SinkServices,
) -> Result<SinkFactory, HResult> {
    if clsid != SINK_COMPONENT_ID {
        debug!("get_class_object: unknown component {clsid}");
        return Err(HResult::CLASS_E_CLASSNOTAVAILABLE);
    }
    if iid != iid::IUNKNOWN && iid != iid::CLASS_FACTORY {
        return Err(HResult::E_NOINTERFACE);
    }
    Ok(SinkFactory { services })
}

impl SinkFactory {
    /// Build a sink and return it as `iid`.
    ///
    /// The new sink starts with one reference owned by the factory; the query
    /// takes a second, then the factory drops its own. On success the caller
    /// holds the only reference.
    ///
    /// # Errors
    /// The interface query's error; the half-built sink is torn down
    pub fn create_instance(&self, iid: Guid) -> Result<InterfaceRef, SinkError> {
        debug!("create_instance({})", identity::describe(iid));
        let sink = EventSink::new(self.services.clone());
        let result = sink.query_interface(iid);
        sink.release()?;
        result
    }
}
