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

//! Bounded cache of one connection per peer
//!
//! Replacement is a second-chance FIFO: entries stay in insertion order, a hit
//! sets the entry's second-chance bit, and eviction sweeps from the front
//! clearing set bits until it finds a clear one. A referenced entry is not
//! moved to the back. Pinned entries are never evicted.
//!
//! The pool is generic over the connection handle so the replacement policy
//! can be exercised without sockets.

use crate::constants::Rank;
use crate::error::{Code, MpiError, MpiResult};

#[derive(Debug)]
struct PoolEntry<C> {
    rank: Rank,
    conn: C,
    second_chance: bool,
    pinned: bool,
}

/// Outcome of a pool lookup
#[derive(Debug)]
pub struct Checkout<C> {
    pub conn: C,
    /// The connection was dialled by this lookup
    pub created: bool,
    /// Entry pushed out to make room
    pub evicted: Option<(Rank, C)>,
}

#[derive(Debug)]
pub struct SocketPool<C> {
    capacity: usize,
    entries: Vec<PoolEntry<C>>,
}

impl<C: Clone> SocketPool<C> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, rank: Rank) -> bool {
        self.entries.iter().any(|e| e.rank == rank)
    }

    /// Ranks currently cached, in queue order
    pub fn ranks(&self) -> Vec<Rank> {
        self.entries.iter().map(|e| e.rank).collect()
    }

    pub fn is_pinned(&self, rank: Rank) -> bool {
        self.entries.iter().any(|e| e.rank == rank && e.pinned)
    }

    /// Look up a cached connection and mark it referenced
    pub fn lookup(&mut self, rank: Rank) -> Option<C> {
        self.entries.iter_mut().find(|e| e.rank == rank).map(|entry| {
            entry.second_chance = true;
            entry.conn.clone()
        })
    }

    /// Return the cached connection for `rank`, dialling one when missing
    ///
    /// The caller owns whatever is evicted and is expected to shut it down.
    pub fn get<F>(&mut self, rank: Rank, pinned: bool, dial: F) -> MpiResult<Checkout<C>>
    where
        F: FnOnce() -> MpiResult<C>,
    {
        if let Some(conn) = self.lookup(rank) {
            if pinned {
                self.pin(rank);
            }
            return Ok(Checkout {
                conn,
                created: false,
                evicted: None,
            });
        }

        // A pool full of pinned entries fails before dialling. Nothing is
        // evicted until the dial has succeeded.
        self.check_room()?;
        let conn = dial()?;
        let evicted = self.insert(rank, conn.clone(), pinned)?;

        Ok(Checkout {
            conn,
            created: true,
            evicted,
        })
    }

    /// Whether a new entry could be admitted, by eviction if need be
    pub fn check_room(&self) -> MpiResult<()> {
        if self.entries.len() < self.capacity || self.entries.iter().any(|e| !e.pinned) {
            Ok(())
        } else {
            Err(self.full_error())
        }
    }

    /// Append an entry for `rank`, evicting one first when the pool is full
    ///
    /// Callers make sure `rank` has no entry yet.
    pub fn insert(&mut self, rank: Rank, conn: C, pinned: bool) -> MpiResult<Option<(Rank, C)>> {
        let evicted = if self.entries.len() >= self.capacity {
            Some(self.evict_one()?)
        } else {
            None
        };
        self.entries.push(PoolEntry {
            rank,
            conn,
            second_chance: false,
            pinned,
        });
        Ok(evicted)
    }

    /// File a connection accepted from `rank`
    ///
    /// Ignored when an entry for that rank already exists, which happens when
    /// two processes dial each other at the same time.
    pub fn add_accepted(&mut self, rank: Rank, conn: C, pinned: bool) -> MpiResult<Option<(Rank, C)>> {
        if self.contains(rank) {
            log::debug!("rank {} already has a pooled connection, keeping the existing one", rank);
            return Ok(None);
        }

        self.insert(rank, conn, pinned)
    }

    pub fn pin(&mut self, rank: Rank) -> bool {
        match self.entries.iter_mut().find(|e| e.rank == rank) {
            Some(entry) => {
                entry.pinned = true;
                true
            }
            None => false,
        }
    }

    /// Drop the entry for `rank` if `matches` accepts its connection
    pub fn remove_if<F>(&mut self, rank: Rank, matches: F) -> Option<C>
    where
        F: Fn(&C) -> bool,
    {
        let pos = self
            .entries
            .iter()
            .position(|e| e.rank == rank && matches(&e.conn))?;
        Some(self.entries.remove(pos).conn)
    }

    pub fn remove(&mut self, rank: Rank) -> Option<C> {
        self.remove_if(rank, |_| true)
    }

    /// Empty the pool, handing back every connection
    pub fn drain(&mut self) -> Vec<(Rank, C)> {
        self.entries.drain(..).map(|e| (e.rank, e.conn)).collect()
    }

    fn evict_one(&mut self) -> MpiResult<(Rank, C)> {
        // Two sweeps: the first may only clear bits
        for _ in 0..2 {
            for i in 0..self.entries.len() {
                let entry = &mut self.entries[i];
                if entry.pinned {
                    continue;
                }
                if entry.second_chance {
                    entry.second_chance = false;
                    continue;
                }
                let entry = self.entries.remove(i);
                log::debug!("evicting pooled connection to rank {}", entry.rank);
                return Ok((entry.rank, entry.conn));
            }
        }

        Err(self.full_error())
    }

    fn full_error(&self) -> MpiError {
        MpiError::new(
            Code::PoolCapacityExceeded,
            format!(
                "all {} pooled connections are pinned, cannot make room",
                self.capacity
            ),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dial(name: &'static str) -> impl FnOnce() -> MpiResult<&'static str> {
        move || Ok(name)
    }

    #[test]
    fn hit_does_not_dial() {
        let mut pool = SocketPool::new(2);
        assert!(pool.get(1, false, dial("a")).unwrap().created);
        let again = pool
            .get(1, false, || -> MpiResult<&'static str> { panic!("should not dial") })
            .unwrap();
        assert!(!again.created);
        assert_eq!(again.conn, "a");
    }

    #[test]
    fn accepted_duplicate_is_ignored() {
        let mut pool = SocketPool::new(4);
        pool.get(2, false, dial("dialled")).unwrap();
        pool.add_accepted(2, "accepted", false).unwrap();
        assert_eq!(pool.lookup(2), Some("dialled"));
        assert_eq!(pool.len(), 1);
    }
}
