//! Client-side narration engine
//!
//! Reads text aloud through interchangeable providers (platform speech, a
//! pre-rendered file, or a remote synthesis endpoint), tracks the spoken word
//! for highlighting, plays multi-shard book narration and saves reading
//! progress. Remote audio is cached by stable storage path with reference
//! counted local blob URLs.

pub mod cache;
pub mod chunker;
pub mod config;
pub mod engine;
pub mod events;
pub mod highlight;
pub mod narration;
pub mod persistence;
pub mod session;
pub mod timing;
pub mod types;

#[cfg(test)]
mod test_support;

pub use cache::{AssetCache, BlobStore, SharedAssetCache};
pub use config::NarrationSettings;
pub use engine::NarrationEngine;
pub use events::{EventEmitter, NarrationEvent, ProviderEvent, Subscription};
pub use narration::{NarrationFactory, NarrationProvider, ProviderConfig};
pub use persistence::{HttpProgressTransport, ProgressSaver};
pub use session::NarrationSession;
pub use types::*;

/// Install a `fmt` subscriber filtered by `RUST_LOG`, defaulting to this crate at info
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lexi_narration=info".into()),
        )
        .init();
}
