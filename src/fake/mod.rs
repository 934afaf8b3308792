//! A scriptable, hardware-free transport for tests and examples.

mod transport;

pub use transport::{uart_services, FakeTransport, WriteRecord};
