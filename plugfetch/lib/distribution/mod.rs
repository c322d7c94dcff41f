//! Registry distribution: resolving references and fetching blobs.
//!
//! The [`Resolver`] and [`Fetcher`] traits are the seams the pull pipeline works against;
//! [`RegistryResolver`] is the HTTP implementation speaking the OCI distribution protocol,
//! with token authentication and the legacy Accept-header fallback.

mod auth;
mod registry;
mod traits;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use registry::*;
pub use traits::*;
