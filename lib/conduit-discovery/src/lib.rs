//! Discovery directory integration: instance registration, TTL renewal and
//! endpoint lookup
pub mod address;
pub mod consul;
pub mod directory;
pub mod registrar;

pub use address::{advertised_address, local_ip};
pub use consul::ConsulDirectory;
pub use directory::{DiscoveryDirectory, ServiceRegistration};
pub use registrar::{DiscoveryRegistrar, RegistrarState, RenewalTask};
