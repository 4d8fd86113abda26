pub mod discovery;
pub mod http;
pub mod traits;

pub use http::{ControlPlaneClient, StampSubmission};
pub use traits::ResponseSink;
