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

//! Algorithm selection
//!
//! Every collective has an ordered list of candidates. The first candidate
//! whose predicate accepts the current settings and communicator size wins.

use crate::collective::CollectiveKind;
use crate::config::CollectiveSettings;
use crate::error::{Code, MpiError, MpiResult};
use crate::topology::TreeShape;

/// What a candidate builds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Choice {
    Tree(TreeShape),
    Dissemination,
    Naive,
}

#[derive(Clone, Copy)]
pub struct Candidate {
    pub name: &'static str,
    pub accepts: fn(&CollectiveSettings, usize) -> bool,
    pub build: fn(&CollectiveSettings) -> Choice,
}

fn tree_candidates() -> Vec<Candidate> {
    vec![
        Candidate {
            name: "forced-binomial",
            accepts: |s, _| s.force_binomial,
            build: |_| Choice::Tree(TreeShape::Binomial),
        },
        Candidate {
            name: "flat-tree",
            accepts: |s, size| size <= s.flat_tree_max,
            build: |_| Choice::Tree(TreeShape::Flat),
        },
        Candidate {
            name: "binomial-tree",
            accepts: |s, size| size <= s.binomial_tree_max,
            build: |_| Choice::Tree(TreeShape::Binomial),
        },
        Candidate {
            name: "static-fanout-tree",
            accepts: |_, _| true,
            build: |s| Choice::Tree(TreeShape::StaticFanout(s.static_fanout)),
        },
    ]
}

pub fn candidates(kind: CollectiveKind) -> Vec<Candidate> {
    match kind {
        CollectiveKind::Allgather => vec![
            Candidate {
                name: "dissemination",
                accepts: |s, size| s.dissemination_allgather && size > 1,
                build: |_| Choice::Dissemination,
            },
            Candidate {
                name: "naive-allgather",
                accepts: |_, _| true,
                build: |_| Choice::Naive,
            },
        ],
        CollectiveKind::Alltoall => vec![Candidate {
            name: "naive-alltoall",
            accepts: |_, _| true,
            build: |_| Choice::Naive,
        }],
        CollectiveKind::Bcast
        | CollectiveKind::Barrier
        | CollectiveKind::Reduce
        | CollectiveKind::Allreduce
        | CollectiveKind::Scatter
        | CollectiveKind::Gather
        | CollectiveKind::Scan => tree_candidates(),
    }
}

/// First accepting candidate for `kind` on a communicator of `size`
pub fn select(kind: CollectiveKind, settings: &CollectiveSettings, size: usize) -> MpiResult<(&'static str, Choice)> {
    let chosen = candidates(kind)
        .into_iter()
        .find(|c| (c.accepts)(settings, size))
        .map(|c| (c.name, (c.build)(settings)))
        .ok_or_else(|| MpiError::new(Code::Invalid, format!("no {} algorithm accepts size {}", kind, size)))?;
    log::trace!("{} over {} ranks uses {}", kind, size, chosen.0);
    Ok(chosen)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_thresholds() {
        let settings = CollectiveSettings::default();
        let pick = |size| select(CollectiveKind::Reduce, &settings, size).unwrap().1;
        assert_eq!(pick(10), Choice::Tree(TreeShape::Flat));
        assert_eq!(pick(11), Choice::Tree(TreeShape::Binomial));
        assert_eq!(pick(50), Choice::Tree(TreeShape::Binomial));
        assert_eq!(pick(51), Choice::Tree(TreeShape::StaticFanout(2)));

        let forced = CollectiveSettings {
            force_binomial: true,
            ..CollectiveSettings::default()
        };
        assert_eq!(
            select(CollectiveKind::Bcast, &forced, 3).unwrap().1,
            Choice::Tree(TreeShape::Binomial)
        );
    }

    #[test]
    fn allgather_falls_back_to_naive() {
        let settings = CollectiveSettings::default();
        assert_eq!(select(CollectiveKind::Allgather, &settings, 5).unwrap().1, Choice::Dissemination);
        assert_eq!(select(CollectiveKind::Allgather, &settings, 1).unwrap().1, Choice::Naive);
    }
}
