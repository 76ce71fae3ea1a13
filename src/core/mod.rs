pub mod deployment;
pub mod error;
pub mod fleet;
pub mod job;
pub mod status;
pub mod supervisor;
pub mod transport;

pub use deployment::{DeployOptions, Deployment, LogLines};
pub use error::{JobError, Result};
pub use fleet::Fleet;
pub use job::JobSpec;
pub use supervisor::{Supervisor, SupervisorKind};
pub use transport::{OpContext, SshTransport, SyncRequest, Transport};
