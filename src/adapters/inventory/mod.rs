//! Inventory adapter module. Implements InventoryPort for the store API.
//!
//! Provides the HTTP adapter and a recording mock for testing.

pub mod http_adapter;
pub mod mock_adapter;

pub use http_adapter::HttpInventoryAdapter;
pub use mock_adapter::MockInventoryAdapter;
