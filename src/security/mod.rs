pub mod tenant_guard;

pub use tenant_guard::TenantGuard;
