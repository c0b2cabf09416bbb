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

//! Tests for spanning tree generation

use tcpmpi::topology::{Tree, TreeShape};
use tcpmpi::{Code, Rank};

const SHAPES: [TreeShape; 4] = [
    TreeShape::Flat,
    TreeShape::Binomial,
    TreeShape::StaticFanout(2),
    TreeShape::StaticFanout(3),
];

fn ceil_log2(n: usize) -> usize {
    let mut bits = 0;
    while (1usize << bits) < n {
        bits += 1;
    }
    bits
}

fn check_invariants(tree: &Tree) {
    let size = tree.size() as Rank;
    let root = tree.root();
    assert_eq!(tree.parent(root), None);

    for r in 0..size {
        for &c in tree.children(r) {
            assert_eq!(tree.parent(c), Some(r), "{} child {} of {}", tree.shape(), c, r);
        }
        if r == root {
            continue;
        }
        let p = tree.parent(r).expect("non-root has a parent");
        assert!(tree.children(p).contains(&r));

        // Walk up without cycles
        let mut hops = 0;
        let mut at = r;
        while let Some(up) = tree.parent(at) {
            at = up;
            hops += 1;
            assert!(hops <= size, "cycle above {}", r);
        }
        assert_eq!(at, root);
    }

    let everyone_else: Vec<Rank> = (0..size).filter(|&r| r != root).collect();
    assert_eq!(tree.descendants(root), everyone_else.as_slice());

    for r in 0..size {
        let mut expected: Vec<Rank> = Vec::new();
        for &c in tree.children(r) {
            expected.push(c);
            expected.extend_from_slice(tree.descendants(c));
        }
        expected.sort_unstable();
        assert_eq!(tree.descendants(r), expected.as_slice());
    }
}

// =========================================================================
// Structural invariants
// =========================================================================

#[test]
fn test_invariants_for_every_size_and_root() {
    for shape in SHAPES {
        for size in 1..=33usize {
            for root in 0..size as Rank {
                let tree = Tree::generate(shape, size, root).unwrap();
                assert_eq!(tree.size(), size);
                check_invariants(&tree);
            }
        }
    }
    println!("✓ trees are spanning, acyclic and consistent for sizes 1..=33");
}

#[test]
fn test_depths() {
    for size in 1..=64usize {
        for root in [0, (size / 2) as Rank, size as Rank - 1] {
            let flat = Tree::generate(TreeShape::Flat, size, root).unwrap();
            assert_eq!(flat.depth(), if size > 1 { 1 } else { 0 });

            let binomial = Tree::generate(TreeShape::Binomial, size, root).unwrap();
            assert!(binomial.depth() <= ceil_log2(size));
            if size.is_power_of_two() {
                assert_eq!(binomial.depth(), ceil_log2(size), "binomial of {}", size);
            }
        }
    }
    println!("✓ flat depth is 1 and binomial depth is at most ceil(log2 size)");
}

#[test]
fn test_binomial_eight_rooted_at_three() {
    let tree = Tree::generate(TreeShape::Binomial, 8, 3).unwrap();
    // Rank 0 takes over the slot rank 3 has when rooted at 0
    assert_eq!(tree.children(3), &[1, 2, 4]);
    assert_eq!(tree.parent(0), Some(1));
    assert_eq!(tree.children(1), &[0, 5]);
    assert_eq!(tree.children(0), &[7]);
    println!("✓ re-rooting swaps the labels of the root and rank 0");
}

#[test]
fn test_static_fanout_shape() {
    let tree = Tree::generate(TreeShape::StaticFanout(3), 10, 0).unwrap();
    assert_eq!(tree.children(0), &[1, 2, 3]);
    assert_eq!(tree.children(1), &[4, 5, 6]);
    assert_eq!(tree.children(3), &[] as &[Rank]);
    assert_eq!(tree.parent(9), Some(2));
    println!("✓ static fanout tree is laid out like a heap");
}

// =========================================================================
// Invalid input
// =========================================================================

#[test]
fn test_invalid_arguments() {
    assert_eq!(
        Tree::generate(TreeShape::Binomial, 4, 4).unwrap_err().code(),
        Code::InvalidRank
    );
    assert_eq!(Tree::generate(TreeShape::Flat, 0, 0).unwrap_err().code(), Code::Invalid);
    assert_eq!(
        Tree::generate(TreeShape::StaticFanout(0), 4, 0).unwrap_err().code(),
        Code::Invalid
    );
    println!("✓ bad roots, empty trees and zero fanout are rejected");
}
