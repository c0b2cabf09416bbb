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

//! Spanning trees used by the collective algorithms
//!
//! A tree is generated for a whole communicator at once and stored as flat
//! per-rank arrays, so any rank can ask about any other rank's parent,
//! children or descendants. Binomial and static fanout trees are built for
//! root 0 and then have the labels of 0 and the real root swapped.

use std::collections::VecDeque;
use std::fmt;

use crate::constants::Rank;
use crate::error::{Code, MpiError, MpiResult};

/// Shape of a spanning tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TreeShape {
    /// Root is the parent of every other rank
    Flat,
    Binomial,
    /// Every interior node has up to `n` children
    StaticFanout(usize),
}

impl fmt::Display for TreeShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TreeShape::Flat => write!(f, "flat"),
            TreeShape::Binomial => write!(f, "binomial"),
            TreeShape::StaticFanout(n) => write!(f, "static-fanout({})", n),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
    shape: TreeShape,
    root: Rank,
    parent: Vec<Option<Rank>>,
    children: Vec<Vec<Rank>>,
    descendants: Vec<Vec<Rank>>,
}

/// Position of the highest set bit, `floor(log2(v))` for v > 0
#[inline]
fn floor_log2(v: usize) -> u32 {
    usize::BITS - 1 - v.leading_zeros()
}

impl Tree {
    /// Build the tree for every rank of a communicator of `size`
    pub fn generate(shape: TreeShape, size: usize, root: Rank) -> MpiResult<Tree> {
        if size == 0 {
            return Err(MpiError::new(Code::Invalid, "cannot build a tree over zero ranks"));
        }
        if root < 0 || root as usize >= size {
            return Err(MpiError::new(
                Code::InvalidRank,
                format!("tree root {} outside 0..{}", root, size),
            ));
        }

        let (parent, children) = match shape {
            TreeShape::Flat => Self::flat_layout(size, root),
            TreeShape::Binomial => {
                let (mut parent, mut children) = Self::binomial_layout(size);
                Self::swap_labels(&mut parent, &mut children, root);
                (parent, children)
            }
            TreeShape::StaticFanout(fanout) => {
                if fanout == 0 {
                    return Err(MpiError::new(Code::Invalid, "static fanout must be at least 1"));
                }
                let (mut parent, mut children) = Self::fanout_layout(size, fanout);
                Self::swap_labels(&mut parent, &mut children, root);
                (parent, children)
            }
        };

        let descendants = Self::collect_descendants(&children, root);
        Ok(Tree {
            shape,
            root,
            parent,
            children,
            descendants,
        })
    }

    fn flat_layout(size: usize, root: Rank) -> (Vec<Option<Rank>>, Vec<Vec<Rank>>) {
        let mut parent = vec![Some(root); size];
        parent[root as usize] = None;
        let mut children = vec![Vec::new(); size];
        children[root as usize] = (0..size as Rank).filter(|&r| r != root).collect();
        (parent, children)
    }

    /// Binomial tree rooted at 0
    fn binomial_layout(size: usize) -> (Vec<Option<Rank>>, Vec<Vec<Rank>>) {
        let mut parent = vec![None; size];
        let mut children = vec![Vec::new(); size];

        for v in 0..size {
            let first_child_bit = if v == 0 {
                0
            } else {
                let i = floor_log2(v);
                parent[v] = Some((v - (1 << i)) as Rank);
                i + 1
            };

            let mut j = first_child_bit;
            while j < usize::BITS - 1 {
                let child = v + (1usize << j);
                if child >= size {
                    break;
                }
                children[v].push(child as Rank);
                j += 1;
            }
        }
        (parent, children)
    }

    fn fanout_layout(size: usize, fanout: usize) -> (Vec<Option<Rank>>, Vec<Vec<Rank>>) {
        let mut parent = vec![None; size];
        let mut children = vec![Vec::new(); size];

        for r in 1..size {
            // ceil(r / f) - 1
            parent[r] = Some(((r + fanout - 1) / fanout - 1) as Rank);
        }
        for (r, kids) in children.iter_mut().enumerate() {
            let first = r * fanout + 1;
            let last = (r * fanout + fanout).min(size - 1);
            if first < size {
                kids.extend((first..=last).map(|c| c as Rank));
            }
        }
        (parent, children)
    }

    /// Exchange the labels of rank 0 and `root` everywhere
    fn swap_labels(parent: &mut [Option<Rank>], children: &mut [Vec<Rank>], root: Rank) {
        if root == 0 {
            return;
        }
        let relabel = |r: Rank| -> Rank {
            if r == 0 {
                root
            } else if r == root {
                0
            } else {
                r
            }
        };

        for p in parent.iter_mut() {
            *p = p.map(relabel);
        }
        for kids in children.iter_mut() {
            for c in kids.iter_mut() {
                *c = relabel(*c);
            }
        }
        parent.swap(0, root as usize);
        children.swap(0, root as usize);
    }

    /// Subtree members of every rank, excluding the rank itself
    fn collect_descendants(children: &[Vec<Rank>], root: Rank) -> Vec<Vec<Rank>> {
        // Breadth-first order, then fold leaves upward in reverse
        let mut order = Vec::with_capacity(children.len());
        let mut queue = VecDeque::from(vec![root]);
        while let Some(r) = queue.pop_front() {
            order.push(r);
            queue.extend(children[r as usize].iter().copied());
        }

        let mut descendants: Vec<Vec<Rank>> = vec![Vec::new(); children.len()];
        for &r in order.iter().rev() {
            let mut below = Vec::new();
            for &c in &children[r as usize] {
                below.push(c);
                below.extend(descendants[c as usize].iter().copied());
            }
            below.sort_unstable();
            descendants[r as usize] = below;
        }
        descendants
    }

    pub fn shape(&self) -> TreeShape {
        self.shape
    }

    pub fn root(&self) -> Rank {
        self.root
    }

    pub fn size(&self) -> usize {
        self.parent.len()
    }

    pub fn parent(&self, rank: Rank) -> Option<Rank> {
        self.parent.get(rank as usize).copied().flatten()
    }

    pub fn children(&self, rank: Rank) -> &[Rank] {
        self.children.get(rank as usize).map(|c| c.as_slice()).unwrap_or(&[])
    }

    pub fn descendants(&self, rank: Rank) -> &[Rank] {
        self.descendants
            .get(rank as usize)
            .map(|d| d.as_slice())
            .unwrap_or(&[])
    }

    /// Longest root-to-leaf path, in edges
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut level = vec![self.root];
        while !level.is_empty() {
            let next: Vec<Rank> = level
                .iter()
                .flat_map(|&r| self.children(r).iter().copied())
                .collect();
            if next.is_empty() {
                break;
            }
            depth += 1;
            level = next;
        }
        depth
    }
}
