//! Minimal SIP registrar proxy used as a test fixture for SIP connection
//! managers. A test supplies a callback deciding which REGISTER requests are
//! accepted; [`fixture::go`] binds the registrar and hands control to the
//! test harness.

pub mod error;
pub mod fixture;
pub mod logging;
pub mod proxy;
pub mod registrar;
pub mod registry;
pub mod settings;
pub mod sip;

pub use error::{FixtureError, ParseError, ProxyError, RegistryError};
pub use fixture::{go, go_with, Harness, ParamValue, StandaloneHarness, TestContext, TestParams};
pub use proxy::{RegistrarHandler, RegistrarPolicy, SipProxy};
pub use registrar::Registrar;
pub use registry::{InMemoryRegistry, Registration};
pub use settings::FixtureConfig;
