//! Certificate authority: the persisted root, its trust store registrations
//! and the per-host leaf issuer.

pub mod authority;
pub mod issuer;
pub mod manager;
pub mod trust;

pub use authority::{RootCredential, RootPaths, ROOT_COMMON_NAME};
pub use issuer::{LeafCredential, LeafIssuer};
pub use manager::{CaManager, EnsureOutcome};
pub use trust::{MemoryTrustStore, TrustStore};
