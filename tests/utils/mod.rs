#![allow(dead_code)]

pub mod call_helpers;
pub mod mock_capture;
pub mod mock_signaling;
pub mod mock_transport;

pub use call_helpers::*;
pub use mock_capture::*;
pub use mock_signaling::*;
pub use mock_transport::*;
