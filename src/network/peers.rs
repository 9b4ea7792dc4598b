//! Outbound peer links.
//!
//! A process-wide, lazily populated map from member identity to TCP stream.
//! Connecting is idempotent; addresses come from the directory. A failed
//! write closes the link and drops its state — the peer either reconnects
//! through our listener or is gone.

use std::collections::HashMap;
use std::net::TcpStream;

use log::{debug, warn};

use super::directory::{DirectoryClient, DirectoryError};
use super::framed::write_frame;

/// The outbound connection map.
#[derive(Debug)]
pub struct PeerLinks {
    directory: DirectoryClient,
    links: HashMap<String, TcpStream>,
}

impl PeerLinks {
    /// Creates an empty link map resolving addresses through `directory`.
    pub fn new(directory: DirectoryClient) -> Self {
        PeerLinks {
            directory,
            links: HashMap::new(),
        }
    }

    /// Ensures a link to `id` exists. No effect if already connected.
    pub fn connect(&mut self, id: &str) -> Result<(), DirectoryError> {
        if self.links.contains_key(id) {
            return Ok(());
        }
        let peer = self.directory.addr(id)?;
        let stream = TcpStream::connect(peer.addr())?;
        debug!("connected to {} at {}", id, peer.addr());
        self.links.insert(id.to_string(), stream);
        Ok(())
    }

    /// Closes the link to `id`, if any.
    pub fn disconnect(&mut self, id: &str) {
        if self.links.remove(id).is_some() {
            debug!("disconnected from {}", id);
        }
    }

    /// Sends a frame to `id`, connecting first if necessary.
    pub fn send(&mut self, id: &str, payload: &[u8]) {
        if let Err(err) = self.connect(id) {
            warn!("cannot reach {}: {}", id, err);
            return;
        }
        let failed = match self.links.get_mut(id) {
            Some(stream) => write_frame(stream, payload).is_err(),
            None => false,
        };
        if failed {
            warn!("send to {} failed, dropping the link", id);
            self.links.remove(id);
        }
    }

    /// Sends a frame to every connected peer.
    pub fn broadcast(&mut self, payload: &[u8]) {
        let ids: Vec<String> = self.links.keys().cloned().collect();
        for id in ids {
            self.send(&id, payload);
        }
    }

    /// Sends a frame to each of the given peers.
    pub fn send_to_many<'a, I: IntoIterator<Item = &'a str>>(&mut self, ids: I, payload: &[u8]) {
        for id in ids {
            self.send(id, payload);
        }
    }

    /// The identities currently connected to.
    pub fn connected(&self) -> Vec<&str> {
        self.links.keys().map(String::as_str).collect()
    }
}
