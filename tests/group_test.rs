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

//! Tests for process groups

use tcpmpi::{Code, Comparison, Group, PeerAddr, Rank, UNDEFINED};

fn world(size: usize, me: Rank) -> Group {
    let members = (0..size)
        .map(|r| PeerAddr {
            host: "127.0.0.1".to_string(),
            port: 7000 + r as u16,
            global_rank: r as Rank,
        })
        .collect();
    Group::new(members, me)
}

// =========================================================================
// Inclusion and exclusion
// =========================================================================

#[test]
fn test_incl_and_excl_are_complements() {
    let g = world(10, 4);
    let picked = [8, 1, 4, 6];
    let inc = g.incl(&picked).unwrap();
    let exc = g.excl(&picked).unwrap();

    assert_eq!(inc.global_ranks(), vec![8, 1, 4, 6]);
    assert_eq!(exc.global_ranks(), vec![0, 2, 3, 5, 7, 9]);
    assert_eq!(inc.size() + exc.size(), g.size());
    assert!(inc.intersection(&exc).is_empty());
    assert_eq!(inc.union(&exc).compare(&g), Comparison::Similar);
    assert_eq!(exc.union(&inc).size(), g.size());
    println!("✓ incl and excl of the same ranks partition the group");
}

#[test]
fn test_my_rank_follows_membership() {
    let g = world(6, 4);
    assert_eq!(g.rank(), Some(4));

    let sub = g.incl(&[5, 4]).unwrap();
    assert_eq!(sub.rank(), Some(1));

    let without_me = g.excl(&[4]).unwrap();
    assert_eq!(without_me.rank(), None);
    assert_eq!(without_me.rank_or_undefined(), UNDEFINED);
    println!("✓ the calling process' rank is recomputed for derived groups");
}

#[test]
fn test_incl_rejects_bad_ranks() {
    let g = world(4, 0);
    assert_eq!(g.incl(&[0, 4]).unwrap_err().code(), Code::InvalidRank);
    assert_eq!(g.incl(&[1, 1]).unwrap_err().code(), Code::InvalidRank);
    assert_eq!(g.excl(&[-2]).unwrap_err().code(), Code::InvalidRank);
    println!("✓ out of range and duplicate ranks are rejected");
}

#[test]
fn test_ranges() {
    let g = world(12, 0);
    let evens = g.range_incl(&[(0, 11, 2)]).unwrap();
    assert_eq!(evens.global_ranks(), vec![0, 2, 4, 6, 8, 10]);

    let odds = g.range_excl(&[(0, 11, 2)]).unwrap();
    assert_eq!(odds.global_ranks(), vec![1, 3, 5, 7, 9, 11]);
    println!("✓ range triplets expand like explicit rank lists");
}

// =========================================================================
// Set operations and comparison
// =========================================================================

#[test]
fn test_set_operations_keep_order() {
    let g = world(8, 0);
    let a = g.incl(&[5, 1, 3]).unwrap();
    let b = g.incl(&[3, 7, 5]).unwrap();

    assert_eq!(a.union(&b).global_ranks(), vec![5, 1, 3, 7]);
    assert_eq!(a.intersection(&b).global_ranks(), vec![5, 3]);
    assert_eq!(a.difference(&b).global_ranks(), vec![1]);
    println!("✓ union, intersection and difference keep the first group's order");
}

#[test]
fn test_translate_ranks() {
    let g = world(6, 0);
    let sub = g.incl(&[4, 2, 0]).unwrap();
    let translated = sub.translate_ranks(&[0, 1, 2], &g).unwrap();
    assert_eq!(translated, vec![4, 2, 0]);

    let back = g.translate_ranks(&[0, 1, 4], &sub).unwrap();
    assert_eq!(back, vec![2, UNDEFINED, 0]);
    println!("✓ ranks translate between groups, UNDEFINED where absent");
}

#[test]
fn test_compare() {
    let g = world(4, 0);
    assert_eq!(g.compare(&world(4, 2)), Comparison::Ident);
    assert_eq!(g.compare(&g.incl(&[3, 2, 1, 0]).unwrap()), Comparison::Similar);
    assert_eq!(g.compare(&g.excl(&[0]).unwrap()), Comparison::Unequal);
    assert!(g.is_superset_of(&g.excl(&[0]).unwrap()));
    assert!(!g.excl(&[0]).unwrap().is_superset_of(&g));
    println!("✓ group comparison and subset checks");
}
