mod device;
mod dtype;

pub use device::DeviceKind;
pub use dtype::resolve_precision;
