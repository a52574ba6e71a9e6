// Shared helpers for the integration tests: a throwaway CA issuing through
// the production certificate manager, and an in-memory TUN adapter so the
// datapath can be exercised without root or a kernel device.
//
// Each test binary pulls in the subset it needs.
#![allow(dead_code)]

pub mod mock;
pub mod testca;
