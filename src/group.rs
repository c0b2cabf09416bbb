// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Process groups
//!
//! A group is an ordered, immutable list of processes. Every derived group is
//! renumbered 0..N-1 in its own order and recomputes where the calling
//! process sits in it. All operations are local.

use std::collections::{HashMap, HashSet};

use crate::constants::{Comparison, Rank, UNDEFINED};
use crate::error::{Code, MpiError, MpiResult};
use crate::net::PeerAddr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    members: Vec<PeerAddr>,
    /// World rank of the calling process
    me: Rank,
    my_rank: Option<Rank>,
}

impl Group {
    /// Group over `members` as seen from the process with world rank `me`
    pub fn new(members: Vec<PeerAddr>, me: Rank) -> Self {
        let my_rank = members
            .iter()
            .position(|m| m.global_rank == me)
            .map(|i| i as Rank);
        Self { members, me, my_rank }
    }

    pub fn empty(me: Rank) -> Self {
        Self::new(Vec::new(), me)
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Rank of the calling process, `None` when it is not a member
    pub fn rank(&self) -> Option<Rank> {
        self.my_rank
    }

    pub fn rank_or_undefined(&self) -> Rank {
        self.my_rank.unwrap_or(UNDEFINED)
    }

    pub fn members(&self) -> &[PeerAddr] {
        &self.members
    }

    pub fn member(&self, rank: Rank) -> MpiResult<&PeerAddr> {
        self.check_rank(rank)?;
        Ok(&self.members[rank as usize])
    }

    /// World rank of the member at `rank`
    pub fn global_rank(&self, rank: Rank) -> MpiResult<Rank> {
        Ok(self.member(rank)?.global_rank)
    }

    pub fn global_ranks(&self) -> Vec<Rank> {
        self.members.iter().map(|m| m.global_rank).collect()
    }

    /// Rank in this group of the process with world rank `global`
    pub fn rank_of_global(&self, global: Rank) -> Option<Rank> {
        self.members
            .iter()
            .position(|m| m.global_rank == global)
            .map(|i| i as Rank)
    }

    pub fn contains(&self, member: &PeerAddr) -> bool {
        self.members.contains(member)
    }

    fn check_rank(&self, rank: Rank) -> MpiResult<()> {
        if rank < 0 || rank as usize >= self.members.len() {
            return Err(MpiError::new(
                Code::InvalidRank,
                format!("rank {} outside group of size {}", rank, self.members.len()),
            ));
        }
        Ok(())
    }

    fn derive(&self, members: Vec<PeerAddr>) -> Group {
        Group::new(members, self.me)
    }

    /// Members at `ranks`, in that order
    pub fn incl(&self, ranks: &[Rank]) -> MpiResult<Group> {
        let mut seen = HashSet::new();
        let mut members = Vec::with_capacity(ranks.len());
        for &r in ranks {
            self.check_rank(r)?;
            if !seen.insert(r) {
                return Err(MpiError::new(
                    Code::InvalidRank,
                    format!("rank {} listed twice", r),
                ));
            }
            members.push(self.members[r as usize].clone());
        }
        Ok(self.derive(members))
    }

    /// Everyone except `ranks`, keeping this group's order
    pub fn excl(&self, ranks: &[Rank]) -> MpiResult<Group> {
        for &r in ranks {
            self.check_rank(r)?;
        }
        let excluded: HashSet<Rank> = ranks.iter().copied().collect();
        let members = self
            .members
            .iter()
            .enumerate()
            .filter(|(i, _)| !excluded.contains(&(*i as Rank)))
            .map(|(_, m)| m.clone())
            .collect();
        Ok(self.derive(members))
    }

    /// Expand `(first, last, stride)` triplets into a rank list
    fn expand_ranges(&self, ranges: &[(Rank, Rank, Rank)]) -> MpiResult<Vec<Rank>> {
        let mut ranks = Vec::new();
        for &(first, last, stride) in ranges {
            if stride == 0 {
                return Err(MpiError::new(Code::Invalid, "range stride must not be zero"));
            }
            let mut r = first;
            while (stride > 0 && r <= last) || (stride < 0 && r >= last) {
                self.check_rank(r)?;
                ranks.push(r);
                r += stride;
            }
        }
        Ok(ranks)
    }

    pub fn range_incl(&self, ranges: &[(Rank, Rank, Rank)]) -> MpiResult<Group> {
        let ranks = self.expand_ranges(ranges)?;
        self.incl(&ranks)
    }

    pub fn range_excl(&self, ranges: &[(Rank, Rank, Rank)]) -> MpiResult<Group> {
        let ranks = self.expand_ranges(ranges)?;
        self.excl(&ranks)
    }

    /// This group's members followed by the other group's new ones
    pub fn union(&self, other: &Group) -> Group {
        let mut members = self.members.clone();
        for m in &other.members {
            if !members.contains(m) {
                members.push(m.clone());
            }
        }
        self.derive(members)
    }

    /// Members of both, in this group's order
    pub fn intersection(&self, other: &Group) -> Group {
        let members = self
            .members
            .iter()
            .filter(|m| other.contains(m))
            .cloned()
            .collect();
        self.derive(members)
    }

    /// Members of this group not in the other, in this group's order
    pub fn difference(&self, other: &Group) -> Group {
        let members = self
            .members
            .iter()
            .filter(|m| !other.contains(m))
            .cloned()
            .collect();
        self.derive(members)
    }

    /// Map ranks in this group to ranks in `other`, `UNDEFINED` where absent
    pub fn translate_ranks(&self, ranks: &[Rank], other: &Group) -> MpiResult<Vec<Rank>> {
        let index: HashMap<&PeerAddr, Rank> = other
            .members
            .iter()
            .enumerate()
            .map(|(i, m)| (m, i as Rank))
            .collect();
        ranks
            .iter()
            .map(|&r| {
                let member = self.member(r)?;
                Ok(index.get(member).copied().unwrap_or(UNDEFINED))
            })
            .collect()
    }

    /// `Ident` for the same members in the same order, `Similar` for the same
    /// members in another order, `Unequal` otherwise
    pub fn compare(&self, other: &Group) -> Comparison {
        if self.members == other.members {
            return Comparison::Ident;
        }
        let mine: HashSet<&PeerAddr> = self.members.iter().collect();
        let theirs: HashSet<&PeerAddr> = other.members.iter().collect();
        if mine == theirs {
            Comparison::Similar
        } else {
            Comparison::Unequal
        }
    }

    /// True when every member of `other` is also a member of this group
    pub fn is_superset_of(&self, other: &Group) -> bool {
        other.members.iter().all(|m| self.contains(m))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world(size: usize, me: Rank) -> Group {
        let members = (0..size)
            .map(|r| PeerAddr {
                host: "localhost".to_string(),
                port: 5000 + r as u16,
                global_rank: r as Rank,
            })
            .collect();
        Group::new(members, me)
    }

    #[test]
    fn range_incl_with_negative_stride() {
        let g = world(8, 6);
        let sub = g.range_incl(&[(7, 1, -3)]).unwrap();
        assert_eq!(sub.global_ranks(), vec![7, 4, 1]);
        assert_eq!(sub.rank(), None);
    }

    #[test]
    fn zero_stride_is_rejected() {
        let g = world(4, 0);
        assert_eq!(g.range_excl(&[(0, 3, 0)]).unwrap_err().code(), Code::Invalid);
    }
}
