//! In-memory `BlockDevice`/`Transport` mocks for exercising
//! `migration-core` end-to-end, plus a deterministic clock for throughput
//! tests. This crate is test/demonstration tooling — it is not, and must
//! not be mistaken for, a real hypervisor's block-driver or transport
//! layer (those stay out of scope per migration-core's design).

pub mod clock;
pub mod device;
pub mod transport;

pub use clock::SimClock;
pub use device::MemBlockDevice;
pub use transport::MemTransport;
