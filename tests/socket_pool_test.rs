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

//! Tests for the second-chance connection pool

use std::cell::Cell;

use tcpmpi::net::SocketPool;
use tcpmpi::{Code, MpiResult};

fn conn(rank: i32) -> impl FnOnce() -> MpiResult<String> {
    move || Ok(format!("conn-{}", rank))
}

// =========================================================================
// Eviction without pinning
// =========================================================================

#[test]
fn test_oldest_unreferenced_entry_is_evicted() {
    let mut pool = SocketPool::new(2);
    pool.get(1, false, conn(1)).unwrap();
    pool.get(2, false, conn(2)).unwrap();

    let checkout = pool.get(3, false, conn(3)).unwrap();
    assert!(checkout.created);
    assert_eq!(checkout.evicted, Some((1, "conn-1".to_string())));
    assert_eq!(pool.ranks(), vec![2, 3]);
    println!("✓ capacity 2: the first entry goes when nothing was reused");
}

#[test]
fn test_referenced_entry_gets_a_second_chance() {
    let mut pool = SocketPool::new(2);
    pool.get(1, false, conn(1)).unwrap();
    pool.get(2, false, conn(2)).unwrap();

    // Reuse rank 1 so its bit is set
    let hit = pool.get(1, false, conn(99)).unwrap();
    assert!(!hit.created);
    assert_eq!(hit.conn, "conn-1");

    let checkout = pool.get(3, false, conn(3)).unwrap();
    assert_eq!(checkout.evicted.map(|(r, _)| r), Some(2));
    assert_eq!(pool.ranks(), vec![1, 3]);
    println!("✓ capacity 2: a reused entry survives one sweep");
}

#[test]
fn test_all_referenced_falls_back_to_fifo() {
    let mut pool = SocketPool::new(2);
    pool.get(1, false, conn(1)).unwrap();
    pool.get(2, false, conn(2)).unwrap();
    pool.lookup(1);
    pool.lookup(2);

    let checkout = pool.get(3, false, conn(3)).unwrap();
    assert_eq!(checkout.evicted.map(|(r, _)| r), Some(1));
    println!("✓ when every entry was reused the oldest still goes");
}

#[test]
fn test_failed_dial_evicts_nothing() {
    let mut pool = SocketPool::new(2);
    pool.get(1, false, conn(1)).unwrap();
    pool.get(2, false, conn(2)).unwrap();

    let err = pool
        .get(3, false, || -> MpiResult<String> {
            Err(tcpmpi::MpiError::new(Code::ConnectionBroken, "connection refused"))
        })
        .unwrap_err();
    assert_eq!(err.code(), Code::ConnectionBroken);
    assert_eq!(pool.len(), 2);
    assert_eq!(pool.ranks(), vec![1, 2]);
    assert_eq!(pool.lookup(1), Some("conn-1".to_string()));

    // The next successful dial still evicts in the usual order
    let checkout = pool.get(3, false, conn(3)).unwrap();
    assert_eq!(checkout.evicted.map(|(r, _)| r), Some(2));
    println!("✓ capacity 2: a refused dial leaves both cached connections in place");
}

// =========================================================================
// Eviction with pinning
// =========================================================================

#[test]
fn test_pinned_entries_are_never_evicted() {
    let mut pool = SocketPool::new(2);
    pool.get(1, true, conn(1)).unwrap();
    pool.get(2, false, conn(2)).unwrap();

    let checkout = pool.get(3, false, conn(3)).unwrap();
    assert_eq!(checkout.evicted.map(|(r, _)| r), Some(2));
    assert!(pool.is_pinned(1));
    assert_eq!(pool.ranks(), vec![1, 3]);
    println!("✓ capacity 2: the pinned entry stays, the other is evicted");
}

#[test]
fn test_full_pinned_pool_fails_without_dialling() {
    let mut pool = SocketPool::new(2);
    pool.get(1, true, conn(1)).unwrap();
    pool.get(2, true, conn(2)).unwrap();

    let dialled = Cell::new(false);
    let err = pool
        .get(3, false, || {
            dialled.set(true);
            Ok("conn-3".to_string())
        })
        .unwrap_err();
    assert_eq!(err.code(), Code::PoolCapacityExceeded);
    assert!(!dialled.get());
    assert_eq!(pool.len(), 2);
    println!("✓ capacity 2 with both pinned: PoolCapacityExceeded and no dial");
}

#[test]
fn test_lookup_with_pin_upgrades_entry() {
    let mut pool = SocketPool::new(2);
    pool.get(1, false, conn(1)).unwrap();
    pool.get(1, true, conn(1)).unwrap();
    assert!(pool.is_pinned(1));
    println!("✓ a later pinned lookup pins an existing entry");
}

// =========================================================================
// Accepted connections
// =========================================================================

#[test]
fn test_accepted_connections_count_against_capacity() {
    let mut pool = SocketPool::new(2);
    assert!(pool.add_accepted(1, "in-1".to_string(), false).unwrap().is_none());
    assert!(pool.add_accepted(2, "in-2".to_string(), false).unwrap().is_none());
    let evicted = pool.add_accepted(3, "in-3".to_string(), false).unwrap();
    assert_eq!(evicted, Some((1, "in-1".to_string())));

    assert_eq!(pool.remove(2), Some("in-2".to_string()));
    assert_eq!(pool.ranks(), vec![3]);
    println!("✓ accepted connections share the pool and its eviction");
}
