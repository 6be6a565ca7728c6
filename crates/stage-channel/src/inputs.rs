//! Input providers: resolve external artifacts into a local tree that a stage
//! can read.
//!
//! Providers are collaborators; this module only fixes their contract and
//! the map/unmap discipline around them. [`with_mapped`] guarantees `unmap`
//! runs on every path out of the consumer, including errors and panics.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Content-addressable store the provider resolves sources from.
pub trait StoreClient {
    /// Directory holding the artifacts of source `name`.
    fn source(&self, name: &str) -> anyhow::Result<PathBuf>;
}

/// What a provider hands back from `map`: where the input landed plus any
/// provider-specific data for the stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapReply {
    pub path: PathBuf,
    pub data: serde_json::Value,
}

pub trait InputProvider {
    /// Make `references` from `origin` available under `target`.
    fn map(
        &mut self,
        store: &dyn StoreClient,
        origin: &str,
        references: &serde_json::Value,
        target: &Path,
        options: Option<&serde_json::Value>,
    ) -> anyhow::Result<MapReply>;

    /// Undo `map`. Must be safe to call when `map` never ran or failed.
    fn unmap(&mut self) -> anyhow::Result<()>;
}

/// Unmaps on drop unless disarmed by [`UnmapGuard::finish`].
struct UnmapGuard<'a, P: InputProvider + ?Sized> {
    provider: &'a mut P,
    armed: bool,
}

impl<P: InputProvider + ?Sized> UnmapGuard<'_, P> {
    fn finish(mut self) -> anyhow::Result<()> {
        self.armed = false;
        self.provider.unmap()
    }
}

impl<P: InputProvider + ?Sized> Drop for UnmapGuard<'_, P> {
    fn drop(&mut self) {
        if self.armed
            && let Err(e) = self.provider.unmap()
        {
            tracing::warn!(error = %e, "Failed to unmap input");
        }
    }
}

/// Map an input, run `f` with the reply, then unmap.
///
/// Errors from `map` and `f` propagate unchanged. If `f` succeeds but
/// `unmap` fails, the unmap error is returned; if both fail, `f`'s error wins.
pub fn with_mapped<P, F, R>(
    provider: &mut P,
    store: &dyn StoreClient,
    origin: &str,
    references: &serde_json::Value,
    target: &Path,
    options: Option<&serde_json::Value>,
    f: F,
) -> anyhow::Result<R>
where
    P: InputProvider + ?Sized,
    F: FnOnce(&MapReply) -> anyhow::Result<R>,
{
    let mut guard = UnmapGuard {
        provider,
        armed: true,
    };

    tracing::debug!(origin, target = %target.display(), "Mapping input");
    let reply = guard
        .provider
        .map(store, origin, references, target, options)?;

    match f(&reply) {
        Ok(value) => {
            guard.finish()?;
            Ok(value)
        }
        Err(e) => {
            drop(guard);
            Err(e)
        }
    }
}
