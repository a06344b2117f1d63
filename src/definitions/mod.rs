pub mod device_namespaces;
pub mod device_request;
pub mod helpers;
pub mod session;

pub use device_namespaces::DeviceNamespacesBuilder;
pub use device_request::{ItemsRequest, RequestDataItem, RequestNamespace};
pub use session::SessionTranscriptBinder;
