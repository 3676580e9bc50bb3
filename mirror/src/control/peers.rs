use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::connector::{Destination, Source};
use crate::error::{ErrorKind, MirrorResult};
use crate::{bail, mirror_error};

#[derive(Debug)]
struct Peers<S, D> {
    sources: HashMap<String, Arc<S>>,
    destinations: HashMap<String, Arc<D>>,
}

/// Named connectors that mirrors reference as their source and destination.
///
/// Peers are shared: every mirror using a peer opens its own sessions to it.
#[derive(Debug)]
pub struct PeerRegistry<S, D> {
    inner: Arc<Mutex<Peers<S, D>>>,
}

impl<S, D> Clone for PeerRegistry<S, D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S, D> Default for PeerRegistry<S, D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, D> PeerRegistry<S, D> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Peers {
                sources: HashMap::new(),
                destinations: HashMap::new(),
            })),
        }
    }
}

impl<S, D> PeerRegistry<S, D>
where
    S: Source,
    D: Destination,
{
    /// Registers `source` under `name`.
    ///
    /// With `if_not_exists`, an existing peer of that name is kept and no error is returned.
    pub async fn create_source_peer(
        &self,
        name: &str,
        source: S,
        if_not_exists: bool,
    ) -> MirrorResult<()> {
        let mut peers = self.inner.lock().await;

        match peers.sources.entry(name.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(source));
                info!(peer = name, kind = S::kind(), "source peer created");
            }
            Entry::Occupied(_) if if_not_exists => {}
            Entry::Occupied(_) => bail!(
                ErrorKind::PeerAlreadyExists,
                "Peer already exists",
                format!("A source peer named {name} already exists")
            ),
        }

        Ok(())
    }

    /// Registers `destination` under `name`.
    ///
    /// With `if_not_exists`, an existing peer of that name is kept and no error is returned.
    pub async fn create_destination_peer(
        &self,
        name: &str,
        destination: D,
        if_not_exists: bool,
    ) -> MirrorResult<()> {
        let mut peers = self.inner.lock().await;

        match peers.destinations.entry(name.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(destination));
                info!(peer = name, kind = D::kind(), "destination peer created");
            }
            Entry::Occupied(_) if if_not_exists => {}
            Entry::Occupied(_) => bail!(
                ErrorKind::PeerAlreadyExists,
                "Peer already exists",
                format!("A destination peer named {name} already exists")
            ),
        }

        Ok(())
    }

    pub async fn source(&self, name: &str) -> MirrorResult<Arc<S>> {
        let peers = self.inner.lock().await;

        peers.sources.get(name).cloned().ok_or_else(|| {
            mirror_error!(
                ErrorKind::PeerNotFound,
                "Peer not found",
                format!("No source peer named {name} exists")
            )
        })
    }

    pub async fn destination(&self, name: &str) -> MirrorResult<Arc<D>> {
        let peers = self.inner.lock().await;

        peers.destinations.get(name).cloned().ok_or_else(|| {
            mirror_error!(
                ErrorKind::PeerNotFound,
                "Peer not found",
                format!("No destination peer named {name} exists")
            )
        })
    }
}
