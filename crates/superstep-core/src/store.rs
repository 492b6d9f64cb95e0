// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-vertex message stores.
//!
//! A fragment keeps two stores: one that compute reads this round and one
//! that arrivals are appended to for the next round. Appends take `&self` and
//! write-lock only the bucket they touch. Reads take a recursive shared lock,
//! so a compute thread may hold one vertex's messages and read the same vertex
//! again. `clear_all` and `swap` take `&mut self`, so the borrow checker keeps
//! them away from concurrent readers and writers.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};

use crate::fragment::Lid;

/// Borrowed view of one vertex's messages. Holds a shared bucket lock, so
/// appends to that bucket wait until it is dropped.
pub type MessageSlice<'a, M> = MappedRwLockReadGuard<'a, [M]>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("local id {lid} out of range ({inner_vertex_count} inner vertices)")]
    OutOfRange { lid: Lid, inner_vertex_count: usize },
}

/// Storage for the messages addressed to a fragment's inner vertices.
pub trait MessageStore<M>: Send + Sync {
    fn inner_vertex_count(&self) -> usize;

    /// Append `msg` to the bucket of `lid`. Safe to call from many threads.
    fn push(&self, lid: Lid, msg: M) -> Result<(), StoreError>;

    /// All messages addressed to `lid`, in arrival order per sender.
    fn get_messages(&self, lid: Lid) -> Result<MessageSlice<'_, M>, StoreError>;

    /// Whether `get_messages(lid)` is non-empty, without copying anything.
    fn message_available(&self, lid: Lid) -> Result<bool, StoreError>;

    fn any_message_received(&self) -> bool;

    /// Total messages held across all vertices
    fn message_count(&self) -> usize;

    fn clear_all(&mut self);

    /// Exchange contents with `other` without touching individual messages.
    fn swap(&mut self, other: &mut Self)
    where
        Self: Sized;

    fn check_lid(&self, lid: Lid) -> Result<usize, StoreError> {
        let index = lid as usize;
        if index >= self.inner_vertex_count() {
            return Err(StoreError::OutOfRange {
                lid,
                inner_vertex_count: self.inner_vertex_count(),
            });
        }
        Ok(index)
    }
}

/// One bucket per inner vertex. Best when most vertices receive messages.
pub struct DenseMessageStore<M> {
    buckets: Vec<RwLock<Vec<M>>>,
    count: AtomicUsize,
}

impl<M> DenseMessageStore<M> {
    pub fn new(inner_vertex_count: usize) -> Self {
        Self {
            buckets: (0..inner_vertex_count)
                .map(|_| RwLock::new(Vec::new()))
                .collect(),
            count: AtomicUsize::new(0),
        }
    }
}

impl<M: Send + Sync> MessageStore<M> for DenseMessageStore<M> {
    fn inner_vertex_count(&self) -> usize {
        self.buckets.len()
    }

    fn push(&self, lid: Lid, msg: M) -> Result<(), StoreError> {
        let index = self.check_lid(lid)?;
        self.buckets[index].write().push(msg);
        self.count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn get_messages(&self, lid: Lid) -> Result<MessageSlice<'_, M>, StoreError> {
        let index = self.check_lid(lid)?;
        Ok(RwLockReadGuard::map(
            self.buckets[index].read_recursive(),
            Vec::as_slice,
        ))
    }

    fn message_available(&self, lid: Lid) -> Result<bool, StoreError> {
        let index = self.check_lid(lid)?;
        Ok(!self.buckets[index].read_recursive().is_empty())
    }

    fn any_message_received(&self) -> bool {
        self.count.load(Ordering::Relaxed) > 0
    }

    fn message_count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    fn clear_all(&mut self) {
        if *self.count.get_mut() == 0 {
            return;
        }
        // keeps bucket capacity for the next round
        for bucket in &mut self.buckets {
            bucket.get_mut().clear();
        }
        *self.count.get_mut() = 0;
    }

    fn swap(&mut self, other: &mut Self) {
        std::mem::swap(&mut self.buckets, &mut other.buckets);
        std::mem::swap(self.count.get_mut(), other.count.get_mut());
    }
}

const SPARSE_SHARDS: usize = 64;

/// Hash buckets created on first message, spread over lock shards.
/// Best when few vertices receive messages in a round.
pub struct SparseMessageStore<M> {
    inner_vertex_count: usize,
    shards: Vec<RwLock<HashMap<Lid, Vec<M>>>>,
    count: AtomicUsize,
}

impl<M> SparseMessageStore<M> {
    pub fn new(inner_vertex_count: usize) -> Self {
        Self {
            inner_vertex_count,
            shards: (0..SPARSE_SHARDS)
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
            count: AtomicUsize::new(0),
        }
    }

    fn shard(&self, lid: Lid) -> &RwLock<HashMap<Lid, Vec<M>>> {
        &self.shards[lid as usize % SPARSE_SHARDS]
    }
}

impl<M: Send + Sync> MessageStore<M> for SparseMessageStore<M> {
    fn inner_vertex_count(&self) -> usize {
        self.inner_vertex_count
    }

    fn push(&self, lid: Lid, msg: M) -> Result<(), StoreError> {
        self.check_lid(lid)?;
        self.shard(lid).write().entry(lid).or_default().push(msg);
        self.count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn get_messages(&self, lid: Lid) -> Result<MessageSlice<'_, M>, StoreError> {
        self.check_lid(lid)?;
        Ok(RwLockReadGuard::map(self.shard(lid).read_recursive(), |shard| {
            shard.get(&lid).map_or(&[][..], Vec::as_slice)
        }))
    }

    fn message_available(&self, lid: Lid) -> Result<bool, StoreError> {
        self.check_lid(lid)?;
        Ok(self
            .shard(lid)
            .read_recursive()
            .get(&lid)
            .is_some_and(|messages| !messages.is_empty()))
    }

    fn any_message_received(&self) -> bool {
        self.count.load(Ordering::Relaxed) > 0
    }

    fn message_count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    fn clear_all(&mut self) {
        if *self.count.get_mut() == 0 {
            return;
        }
        for shard in &mut self.shards {
            shard.get_mut().clear();
        }
        *self.count.get_mut() = 0;
    }

    fn swap(&mut self, other: &mut Self) {
        std::mem::swap(&mut self.shards, &mut other.shards);
        std::mem::swap(self.count.get_mut(), other.count.get_mut());
        std::mem::swap(&mut self.inner_vertex_count, &mut other.inner_vertex_count);
    }
}

/// Store variants selectable from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Dense,
    Sparse,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dense => f.write_str("dense"),
            Self::Sparse => f.write_str("sparse"),
        }
    }
}

impl FromStr for StoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dense" => Ok(Self::Dense),
            "sparse" => Ok(Self::Sparse),
            other => Err(format!("unknown message store '{}'", other)),
        }
    }
}

/// A store of the variant chosen at configuration time.
pub enum AnyMessageStore<M> {
    Dense(DenseMessageStore<M>),
    Sparse(SparseMessageStore<M>),
}

impl<M> AnyMessageStore<M> {
    pub fn new(kind: StoreKind, inner_vertex_count: usize) -> Self {
        match kind {
            StoreKind::Dense => Self::Dense(DenseMessageStore::new(inner_vertex_count)),
            StoreKind::Sparse => Self::Sparse(SparseMessageStore::new(inner_vertex_count)),
        }
    }

    pub fn kind(&self) -> StoreKind {
        match self {
            Self::Dense(_) => StoreKind::Dense,
            Self::Sparse(_) => StoreKind::Sparse,
        }
    }
}

impl<M: Send + Sync> MessageStore<M> for AnyMessageStore<M> {
    fn inner_vertex_count(&self) -> usize {
        match self {
            Self::Dense(store) => store.inner_vertex_count(),
            Self::Sparse(store) => store.inner_vertex_count(),
        }
    }

    fn push(&self, lid: Lid, msg: M) -> Result<(), StoreError> {
        match self {
            Self::Dense(store) => store.push(lid, msg),
            Self::Sparse(store) => store.push(lid, msg),
        }
    }

    fn get_messages(&self, lid: Lid) -> Result<MessageSlice<'_, M>, StoreError> {
        match self {
            Self::Dense(store) => store.get_messages(lid),
            Self::Sparse(store) => store.get_messages(lid),
        }
    }

    fn message_available(&self, lid: Lid) -> Result<bool, StoreError> {
        match self {
            Self::Dense(store) => store.message_available(lid),
            Self::Sparse(store) => store.message_available(lid),
        }
    }

    fn any_message_received(&self) -> bool {
        match self {
            Self::Dense(store) => store.any_message_received(),
            Self::Sparse(store) => store.any_message_received(),
        }
    }

    fn message_count(&self) -> usize {
        match self {
            Self::Dense(store) => store.message_count(),
            Self::Sparse(store) => store.message_count(),
        }
    }

    fn clear_all(&mut self) {
        match self {
            Self::Dense(store) => store.clear_all(),
            Self::Sparse(store) => store.clear_all(),
        }
    }

    /// Exchanges the whole variant, so stores of different kinds swap too.
    fn swap(&mut self, other: &mut Self) {
        std::mem::swap(self, other);
    }
}
