//! UI plugins shipped with the supervisor. Both implement the
//! [`kfwd_core::plugin::UiPlugin`] capability; the fleet manager only ever
//! sees the trait.

pub mod grpcui;
pub mod swagger;

pub use grpcui::GrpcUiPlugin;
pub use swagger::SwaggerUiPlugin;
