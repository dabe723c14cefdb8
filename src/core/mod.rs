pub mod relay;
pub mod rewrite;
pub mod router;
pub mod session;

pub use router::ProviderRouter;
pub use session::SessionTracker;
