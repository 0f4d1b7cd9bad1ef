pub mod agents;
pub mod dburl;
pub mod launchers;
pub mod mqtt;
pub mod registration;
pub mod secrets;
pub mod supervisor;

pub use registration::Registration;
pub use supervisor::Supervisor;
pub use supervisor::SupervisorError;
