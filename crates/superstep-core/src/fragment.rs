// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Vertex identity and the fragment capability consumed by the manager.
//!
//! A vertex has three ids: the application's original id, a job-wide global
//! id, and a local id that indexes the owning fragment's message buckets.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

/// Fragment (and worker) identifier in `[0, fnum)`
pub type FragmentId = u32;
/// Job-wide vertex id
pub type Gid = u64;
/// Dense per-fragment vertex index
pub type Lid = u32;

/// Packs a fragment id and a local id into a global id.
///
/// The fragment id occupies the high bits; the offset is wide enough for
/// `fnum` fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdParser {
    fid_offset: u32,
    lid_mask: u64,
}

impl IdParser {
    pub fn new(fnum: u32) -> Self {
        let fid_bits = if fnum <= 1 {
            1
        } else {
            32 - (fnum - 1).leading_zeros()
        };
        let fid_offset = 64 - fid_bits;
        Self {
            fid_offset,
            lid_mask: (1u64 << fid_offset) - 1,
        }
    }

    pub fn gid_of(&self, fid: FragmentId, lid: Lid) -> Gid {
        (u64::from(fid) << self.fid_offset) | u64::from(lid)
    }

    pub fn fid_of(&self, gid: Gid) -> FragmentId {
        (gid >> self.fid_offset) as FragmentId
    }

    /// Local id field of `gid`; `None` when it does not fit a [`Lid`].
    pub fn lid_of(&self, gid: Gid) -> Option<Lid> {
        Lid::try_from(gid & self.lid_mask).ok()
    }
}

/// Graph partition owned by one worker.
///
/// Storage and partitioning live outside this crate; the manager only needs
/// id translation and outgoing adjacency.
pub trait Fragment: Send + Sync + 'static {
    /// Application-level vertex id
    type Oid: Clone + Eq + Hash + Debug + Send + Sync;

    fn fid(&self) -> FragmentId;

    /// Number of fragments in the job
    fn fnum(&self) -> u32;

    /// Vertices owned by this fragment; valid local ids are `0..inner_vertex_count()`
    fn inner_vertex_count(&self) -> usize;

    fn oid_to_gid(&self, oid: &Self::Oid) -> Option<Gid>;

    fn gid_to_oid(&self, gid: Gid) -> Option<Self::Oid>;

    /// Fragment owning `gid`
    fn frag_id(&self, gid: Gid) -> FragmentId;

    /// Local id of a vertex this fragment owns; `None` for any other vertex
    fn inner_gid_to_lid(&self, gid: Gid) -> Option<Lid>;

    fn inner_lid_to_gid(&self, lid: Lid) -> Option<Gid>;

    /// Global ids of the out-neighbours of an inner vertex
    fn out_neighbors(&self, lid: Lid) -> &[Gid];

    fn is_outer_vertex(&self, gid: Gid) -> bool {
        self.frag_id(gid) != self.fid()
    }
}

/// In-memory fragment built from a global edge list.
///
/// Every worker builds its own view from the same vertex and edge lists and
/// the same partition function, so all workers agree on global ids.
#[derive(Debug, Clone)]
pub struct EdgeListFragment<O> {
    fid: FragmentId,
    fnum: u32,
    parser: IdParser,
    oid_to_gid: HashMap<O, Gid>,
    gid_to_oid: HashMap<Gid, O>,
    inner_oids: Vec<O>,
    offsets: Vec<usize>,
    neighbors: Vec<Gid>,
}

impl<O> EdgeListFragment<O>
where
    O: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    /// Build fragment `fid` of `fnum`.
    ///
    /// Local ids follow the order of `vertices`. Edges whose endpoints are not
    /// in `vertices` are skipped.
    pub fn build(
        fid: FragmentId,
        fnum: u32,
        vertices: &[O],
        edges: &[(O, O)],
        partition: impl Fn(&O) -> FragmentId,
    ) -> Self {
        let parser = IdParser::new(fnum);
        let mut next_lid = vec![0 as Lid; fnum as usize];
        let mut oid_to_gid = HashMap::with_capacity(vertices.len());
        let mut gid_to_oid = HashMap::with_capacity(vertices.len());
        let mut inner_oids = Vec::new();

        for oid in vertices {
            if oid_to_gid.contains_key(oid) {
                continue;
            }
            let owner = partition(oid) % fnum.max(1);
            let lid = next_lid[owner as usize];
            next_lid[owner as usize] += 1;
            let gid = parser.gid_of(owner, lid);
            oid_to_gid.insert(oid.clone(), gid);
            gid_to_oid.insert(gid, oid.clone());
            if owner == fid {
                inner_oids.push(oid.clone());
            }
        }

        let mut adjacency: Vec<Vec<Gid>> = vec![Vec::new(); inner_oids.len()];
        for (src, dst) in edges {
            let (Some(&src_gid), Some(&dst_gid)) = (oid_to_gid.get(src), oid_to_gid.get(dst))
            else {
                continue;
            };
            if parser.fid_of(src_gid) == fid
                && let Some(lid) = parser.lid_of(src_gid)
            {
                adjacency[lid as usize].push(dst_gid);
            }
        }

        let mut offsets = Vec::with_capacity(adjacency.len() + 1);
        let mut neighbors = Vec::new();
        offsets.push(0);
        for list in adjacency {
            neighbors.extend(list);
            offsets.push(neighbors.len());
        }

        Self {
            fid,
            fnum,
            parser,
            oid_to_gid,
            gid_to_oid,
            inner_oids,
            offsets,
            neighbors,
        }
    }

    /// Original ids of the inner vertices, indexed by local id
    pub fn inner_oids(&self) -> &[O] {
        &self.inner_oids
    }

    pub fn id_parser(&self) -> IdParser {
        self.parser
    }
}

impl<O> Fragment for EdgeListFragment<O>
where
    O: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    type Oid = O;

    fn fid(&self) -> FragmentId {
        self.fid
    }

    fn fnum(&self) -> u32 {
        self.fnum
    }

    fn inner_vertex_count(&self) -> usize {
        self.inner_oids.len()
    }

    fn oid_to_gid(&self, oid: &O) -> Option<Gid> {
        self.oid_to_gid.get(oid).copied()
    }

    fn gid_to_oid(&self, gid: Gid) -> Option<O> {
        self.gid_to_oid.get(&gid).cloned()
    }

    fn frag_id(&self, gid: Gid) -> FragmentId {
        self.parser.fid_of(gid)
    }

    fn inner_gid_to_lid(&self, gid: Gid) -> Option<Lid> {
        if self.parser.fid_of(gid) != self.fid {
            return None;
        }
        let lid = self.parser.lid_of(gid)?;
        ((lid as usize) < self.inner_oids.len()).then_some(lid)
    }

    fn inner_lid_to_gid(&self, lid: Lid) -> Option<Gid> {
        ((lid as usize) < self.inner_oids.len()).then(|| self.parser.gid_of(self.fid, lid))
    }

    fn out_neighbors(&self, lid: Lid) -> &[Gid] {
        let lid = lid as usize;
        if lid + 1 >= self.offsets.len() {
            return &[];
        }
        &self.neighbors[self.offsets[lid]..self.offsets[lid + 1]]
    }
}
