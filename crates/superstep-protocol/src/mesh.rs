// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The all-to-all link set of one worker.

use std::net::{SocketAddr, ToSocketAddrs};

use futures::future::try_join_all;
use tracing::{info, instrument};

use crate::client::{BarrierVote, ClientError, PeerClient, PeerClientConfig, PeerLink};
use crate::control::{BarrierAck, ControlRequest, ControlResponse};
use crate::frame::Frame;

/// Static `fid -> address` table, fixed for the lifetime of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerDirectory {
    addrs: Vec<SocketAddr>,
}

impl WorkerDirectory {
    /// Worker `i` listens on `addrs[i]`
    pub fn new(addrs: Vec<SocketAddr>) -> Self {
        Self { addrs }
    }

    /// Resolve `(host, port)` pairs once, taking the first address of each.
    pub fn resolve<H: AsRef<str>>(hosts: &[(H, u16)]) -> std::io::Result<Self> {
        let addrs = hosts
            .iter()
            .map(|(host, port)| {
                (host.as_ref(), *port)
                    .to_socket_addrs()?
                    .next()
                    .ok_or_else(|| {
                        std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            format!("{}:{} did not resolve", host.as_ref(), port),
                        )
                    })
            })
            .collect::<std::io::Result<Vec<_>>>()?;
        Ok(Self { addrs })
    }

    pub fn get(&self, fid: u32) -> Option<SocketAddr> {
        self.addrs.get(fid as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, SocketAddr)> + '_ {
        self.addrs
            .iter()
            .enumerate()
            .map(|(fid, addr)| (fid as u32, *addr))
    }
}

/// One link to every other worker of the job.
pub struct PeerMesh {
    local_fid: u32,
    client: PeerClient,
    links: Vec<Option<PeerLink>>,
}

impl PeerMesh {
    /// Eagerly connect to every peer in `directory`, one after the other.
    ///
    /// Each peer gets the full retry budget of `config`. Must be called inside
    /// a tokio runtime; the link tasks are spawned on it.
    #[instrument(skip(directory, config), fields(peers = directory.len()))]
    pub async fn connect(
        local_fid: u32,
        directory: &WorkerDirectory,
        config: PeerClientConfig,
    ) -> Result<Self, ClientError> {
        let frag_num = directory.len() as u32;
        let client = PeerClient::new(config)?;
        let mut links = Vec::with_capacity(directory.len());

        for (fid, addr) in directory.iter() {
            if fid == local_fid {
                links.push(None);
                continue;
            }
            let link = client
                .connect_with_retry(local_fid, frag_num, fid, addr)
                .await?;
            links.push(Some(link));
        }

        info!(local_fid, peers = frag_num.saturating_sub(1), "mesh connected");
        Ok(Self {
            local_fid,
            client,
            links,
        })
    }

    pub fn local_fid(&self) -> u32 {
        self.local_fid
    }

    pub fn peer_count(&self) -> usize {
        self.links.iter().flatten().count()
    }

    /// Fragment ids of all peers
    pub fn peers(&self) -> impl Iterator<Item = u32> + '_ {
        self.links.iter().flatten().map(PeerLink::peer)
    }

    pub fn link(&self, fid: u32) -> Result<&PeerLink, ClientError> {
        self.links
            .get(fid as usize)
            .and_then(Option::as_ref)
            .ok_or(ClientError::UnknownPeer(fid))
    }

    /// Queue a message batch for `dst`. Waits while that link's queue is full.
    pub fn send_batch(&self, dst: u32, frame: &Frame) -> Result<(), ClientError> {
        self.link(dst)?.send_batch(frame)
    }

    pub async fn request(
        &self,
        dst: u32,
        request: &ControlRequest,
    ) -> Result<ControlResponse, ClientError> {
        self.link(dst)?.request(request).await
    }

    /// Send the barrier for `round` to every peer at once and wait for all
    /// acknowledgements.
    pub async fn barrier(
        &self,
        round: u64,
        vote: BarrierVote,
    ) -> Result<Vec<BarrierAck>, ClientError> {
        try_join_all(self.links.iter().flatten().map(|link| link.barrier(round, vote))).await
    }

    /// Total bytes queued across all links
    pub fn bytes_sent(&self) -> u64 {
        self.links.iter().flatten().map(PeerLink::bytes_sent).sum()
    }

    /// Close every link and the client endpoint. Safe to call more than once.
    pub fn close(&self) {
        for link in self.links.iter().flatten() {
            link.close();
        }
        self.client.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_lookup() {
        let directory = WorkerDirectory::new(vec![
            "127.0.0.1:7000".parse().unwrap(),
            "127.0.0.1:7001".parse().unwrap(),
        ]);
        assert_eq!(directory.len(), 2);
        assert_eq!(directory.get(1), Some("127.0.0.1:7001".parse().unwrap()));
        assert_eq!(directory.get(2), None);
        let fids: Vec<u32> = directory.iter().map(|(fid, _)| fid).collect();
        assert_eq!(fids, vec![0, 1]);
    }

    #[test]
    fn test_directory_resolve() {
        let directory = WorkerDirectory::resolve(&[("127.0.0.1", 7100), ("127.0.0.1", 7101)])
            .unwrap();
        assert_eq!(directory.get(0), Some("127.0.0.1:7100".parse().unwrap()));
        assert_eq!(directory.get(1), Some("127.0.0.1:7101".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_single_worker_mesh_has_no_links() {
        let directory = WorkerDirectory::new(vec!["127.0.0.1:7200".parse().unwrap()]);
        let mesh = PeerMesh::connect(0, &directory, PeerClientConfig::default())
            .await
            .unwrap();
        assert_eq!(mesh.peer_count(), 0);
        assert!(matches!(mesh.link(0), Err(ClientError::UnknownPeer(0))));
        assert!(mesh.barrier(0, BarrierVote::default()).await.unwrap().is_empty());
        mesh.close();
    }
}
