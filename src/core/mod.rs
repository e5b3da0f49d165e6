pub mod archive;
pub mod config;
pub mod docker;
pub mod gate;
pub mod migration;
pub mod report;
pub mod restore;
pub mod secrets;
pub mod snapshot;
pub mod storage;
pub mod supervisor;
pub mod transport;
pub mod validator;

pub use config::EnvFile;
pub use docker::DockerManager;
pub use supervisor::StackSupervisor;
