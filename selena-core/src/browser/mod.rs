pub mod error;
pub mod portal;
pub mod session;

pub use error::{BrowserError, BrowserResult};
pub use portal::{BfoPortal, RegistryPortal, SearchOutcome};
pub use session::{LaunchOverrides, Session, SessionLauncher, SessionPage};
