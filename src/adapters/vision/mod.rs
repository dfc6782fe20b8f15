//! Vision adapter module. Implements VisionPort for the detection service.
//!
//! Provides the HTTP adapter and a mock adapter for testing.

pub mod http_adapter;
pub mod mock_adapter;

pub use http_adapter::HttpVisionAdapter;
pub use mock_adapter::MockVisionAdapter;
