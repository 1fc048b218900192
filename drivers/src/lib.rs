//! Concrete `RobotDriver` implementations behind the ports declared in
//! `labcell_core::driver`. Nothing outside this crate should need to know
//! a Meca500 speaks ASCII-over-TCP or an OT-2 speaks HTTP/JSON.

pub mod arm;
pub mod broadcast;
pub mod liquid_handler;
pub mod processor;
pub mod wiper;
