//! machinery: virtual machine definitions, emulator command compilation,
//! process supervision, persistence and disk image creation.
//!
//! The library is presentation-free. A front end builds or loads a
//! [`machine::MachineConfig`], persists it through
//! [`machine::store::MachineStore`], launches it with a
//! [`machine::supervisor::Supervisor`] and renders the
//! [`machine::supervisor::SupervisorEvent`]s it receives.

pub mod error;
pub mod host;
pub mod logging;
pub mod machine;
pub mod paths;
pub mod settings;
