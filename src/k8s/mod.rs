pub mod client;
pub mod informer;
pub mod types;

pub use client::{load_client_config, K8sClient};
pub use informer::SharedInformerFactory;
pub use types::{preferred_address, NodeAddressType};
