pub mod channelfinder;

use async_trait::async_trait;
use shared::types::ResolvedAddress;

pub use channelfinder::ChannelFinderClient;

/// Source of override addresses for PV names.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Returns the override address for `name`, or `None` when there is none
    /// or the directory could not be asked in time.
    async fn lookup(&self, name: &str) -> Option<ResolvedAddress>;
}
