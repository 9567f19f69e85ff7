//! Admission control: bearer-token validation against a rotating key set,
//! plus the locally mirrored revocation set.

pub mod jwks;
pub mod revocation;
pub mod validation;

pub use jwks::JwksProvider;
pub use revocation::{spawn_refresher, RevocationCache, RevocationRefresher};
pub use validation::{Claims, TokenValidator};
