//! Interface identities the sink answers to.
//!
//! Callback interfaces are successive supersets, so supporting version N
//! means supporting every version below it. Versions above
//! [`IMPLEMENTED_VERSION`] are listed so they can be named in logs, but they
//! answer "not supported".

use clrscope_common::{iid, Guid};

/// Highest callback interface version this build implements
pub const IMPLEMENTED_VERSION: u8 = 9;

/// `IUnknown` is version 0 of the family
const IDENTITIES: &[(Guid, u8, &str)] = &[
    (iid::IUNKNOWN, 0, "IUnknown"),
    (iid::CALLBACK, 1, "ICorProfilerCallback"),
    (iid::CALLBACK_2, 2, "ICorProfilerCallback2"),
    (iid::CALLBACK_3, 3, "ICorProfilerCallback3"),
    (iid::CALLBACK_4, 4, "ICorProfilerCallback4"),
    (iid::CALLBACK_5, 5, "ICorProfilerCallback5"),
    (iid::CALLBACK_6, 6, "ICorProfilerCallback6"),
    (iid::CALLBACK_7, 7, "ICorProfilerCallback7"),
    (iid::CALLBACK_8, 8, "ICorProfilerCallback8"),
    (iid::CALLBACK_9, 9, "ICorProfilerCallback9"),
    (iid::CALLBACK_10, 10, "ICorProfilerCallback10"),
    (iid::CALLBACK_11, 11, "ICorProfilerCallback11"),
];

/// Callback family version of `iid`, if it belongs to the family
#[must_use]
pub fn family_version(iid: Guid) -> Option<u8> {
    IDENTITIES.iter().find(|(id, _, _)| *id == iid).map(|(_, version, _)| *version)
}

#[must_use]
pub fn is_supported(iid: Guid) -> bool {
    family_version(iid).is_some_and(|version| version <= IMPLEMENTED_VERSION)
}

/// Interface name for logs, falling back to the GUID
#[must_use]
pub fn describe(iid: Guid) -> String {
    IDENTITIES
        .iter()
        .find(|(id, _, _)| *id == iid)
        .map_or_else(|| iid.to_string(), |(_, _, name)| (*name).to_string())
}

/// Every supported identity, lowest version first
pub fn supported() -> impl Iterator<Item = Guid> {
    IDENTITIES
        .iter()
        .filter(|(_, version, _)| *version <= IMPLEMENTED_VERSION)
        .map(|(id, _, _)| *id)
}
