pub mod naming;
pub mod validation;

pub use naming::{created_by, name_prefix, NameBuilder};
pub use validation::{
    validate_cluster_name, validate_hostname, validate_ip_address, validate_object_name,
    validate_port, validate_protocol, validate_tenant_name, ValidationError, ValidationResult,
};
