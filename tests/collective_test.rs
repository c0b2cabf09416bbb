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

//! Collective and communicator tests over the in-process loopback fabric

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tcpmpi::engine::{Engine, EngineOptions, Inbox};
use tcpmpi::net::loopback::LoopbackFabric;
use tcpmpi::{
    Avg, CollectiveSettings, Code, Communicator, Comparison, FnOp, Max, Min, PeerAddr, Prod, Rank, Sum, UNDEFINED,
};

struct Cluster {
    fabric: Arc<LoopbackFabric>,
    engines: Vec<Engine>,
    comms: Vec<Communicator>,
}

impl Cluster {
    fn new(size: usize) -> Self {
        Self::with_settings(size, CollectiveSettings::default())
    }

    fn with_settings(size: usize, settings: CollectiveSettings) -> Self {
        let fabric = LoopbackFabric::new(size);
        let roster: Vec<PeerAddr> = (0..size)
            .map(|r| PeerAddr {
                host: "loopback".to_string(),
                port: 0,
                global_rank: r as Rank,
            })
            .collect();

        let mut engines = Vec::new();
        let mut comms = Vec::new();
        for r in 0..size as Rank {
            let inbox = Inbox::new();
            fabric.attach(r, inbox.clone());
            let options = EngineOptions::new(r)
                .with_settings(settings.clone())
                .with_exit_action(|_| {});
            let engine = Engine::start(options, inbox, fabric.endpoint(r)).unwrap();
            comms.push(Communicator::world(&engine, roster.clone()).unwrap());
            engines.push(engine);
        }
        Self { fabric, engines, comms }
    }

    fn run<T, F>(&self, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(&Communicator) -> T + Sync,
    {
        let f = &f;
        thread::scope(|s| {
            let handles: Vec<_> = self.comms.iter().map(|c| s.spawn(move || f(c))).collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        for engine in &self.engines {
            engine.shutdown();
        }
    }
}

fn binomial() -> CollectiveSettings {
    CollectiveSettings {
        force_binomial: true,
        ..CollectiveSettings::default()
    }
}

fn fanout(n: usize) -> CollectiveSettings {
    CollectiveSettings {
        flat_tree_max: 1,
        binomial_tree_max: 1,
        static_fanout: n,
        ..CollectiveSettings::default()
    }
}

// =========================================================================
// Reductions
// =========================================================================

#[test]
fn test_binomial_allreduce_of_eight() {
    let cluster = Cluster::with_settings(8, binomial());
    let sums = cluster.run(|comm| comm.allreduce(comm.rank() + 1, Sum).unwrap());
    assert_eq!(sums, vec![36; 8]);
    println!("✓ binomial allreduce of rank+1 over 8 ranks is 36 everywhere");
}

#[test]
fn test_allreduce_for_every_tree_shape() {
    for settings in [CollectiveSettings::default(), binomial(), fanout(2), fanout(3)] {
        let cluster = Cluster::with_settings(7, settings.clone());
        let results = cluster.run(|comm| {
            let r = comm.rank() as i64;
            (
                comm.allreduce(r, Max).unwrap(),
                comm.allreduce(r, Min).unwrap(),
                comm.allreduce(r + 1, Prod).unwrap(),
            )
        });
        assert!(results.iter().all(|&v| v == (6, 0, 5040)), "{:?}", settings);
    }
    println!("✓ max, min and prod agree across flat, binomial and fanout trees");
}

#[test]
fn test_reduce_only_root_gets_result() {
    let cluster = Cluster::new(6);
    let results = cluster.run(|comm| comm.reduce(comm.rank() as f64, Sum, 4).unwrap());
    for (rank, result) in results.into_iter().enumerate() {
        if rank == 4 {
            assert_eq!(result, Some(15.0));
        } else {
            assert_eq!(result, None);
        }
    }
    println!("✓ reduce delivers to the root only");
}

#[test]
fn test_average_is_not_partially_reduced() {
    let cluster = Cluster::with_settings(5, binomial());
    let averages = cluster.run(|comm| comm.allreduce((comm.rank() * 10) as f64, Avg).unwrap());
    assert!(averages.iter().all(|&a| (a - 20.0).abs() < 1e-9));
    println!("✓ average over 5 ranks is exact");
}

#[test]
fn test_non_commutative_operator_sees_rank_order() {
    let cluster = Cluster::with_settings(6, binomial());
    let concat = |parts: Vec<String>| parts.concat();
    let results = cluster.run(|comm| comm.allreduce(comm.rank().to_string(), FnOp::new(concat)).unwrap());
    assert!(results.iter().all(|s| s == "012345"), "{:?}", results);
    println!("✓ custom operators are applied to values in rank order");
}

#[test]
fn test_scan_prefix_sums() {
    let cluster = Cluster::new(8);
    let prefixes = cluster.run(|comm| comm.scan(comm.rank() + 1, Sum).unwrap());
    assert_eq!(prefixes, vec![1, 3, 6, 10, 15, 21, 28, 36]);
    println!("✓ scan yields inclusive prefix sums");
}

// =========================================================================
// Data movement
// =========================================================================

#[test]
fn test_bcast_from_every_root() {
    let cluster = Cluster::with_settings(5, fanout(2));
    for root in 0..5 {
        let got = cluster.run(|comm| {
            let mine = format!("hello from {}", comm.rank());
            let data = if comm.rank() == root { Some(&mine) } else { None };
            comm.bcast(data, root).unwrap()
        });
        assert!(got.iter().all(|s| *s == format!("hello from {}", root)));
    }
    println!("✓ bcast reaches everyone from every root");
}

#[test]
fn test_scatter_range_from_root_three() {
    let k = 4usize;
    let cluster = Cluster::with_settings(8, binomial());
    let chunks = cluster.run(|comm| {
        let all: Vec<u64> = (0..(8 * k) as u64).collect();
        let data = if comm.rank() == 3 { Some(all.as_slice()) } else { None };
        comm.scatter(data, 3).unwrap()
    });
    for (rank, chunk) in chunks.into_iter().enumerate() {
        let expected: Vec<u64> = ((rank * k) as u64..((rank + 1) * k) as u64).collect();
        assert_eq!(chunk, expected);
    }
    println!("✓ scatter of range(8k) at root 3 gives each rank its slice");
}

#[test]
fn test_scatter_rejects_uneven_split() {
    let cluster = Cluster::new(1);
    let single = cluster.comms[0].scatter(Some(&[1u8, 2, 3][..]), 0).unwrap();
    assert_eq!(single, vec![1, 2, 3]);

    let cluster = Cluster::new(2);
    let err = cluster.comms[0].scatter(Some(&[1u8, 2, 3][..]), 0).unwrap_err();
    assert_eq!(err.code(), Code::Invalid);
    println!("✓ scatter needs a multiple of the communicator size");
}

#[test]
fn test_gather_at_root() {
    let cluster = Cluster::new(6);
    let results = cluster.run(|comm| comm.gather(&(comm.rank() * 2), 1).unwrap());
    assert_eq!(results[1], Some(vec![0, 2, 4, 6, 8, 10]));
    assert!(results.iter().enumerate().all(|(r, v)| r == 1 || v.is_none()));
    println!("✓ gather collects values in rank order at the root");
}

#[test]
fn test_allgather_both_algorithms() {
    for dissemination in [true, false] {
        let settings = CollectiveSettings {
            dissemination_allgather: dissemination,
            ..CollectiveSettings::default()
        };
        let cluster = Cluster::with_settings(7, settings);
        let results = cluster.run(|comm| comm.allgather(&format!("r{}", comm.rank())).unwrap());
        let expected: Vec<String> = (0..7).map(|r| format!("r{}", r)).collect();
        assert!(results.iter().all(|v| *v == expected));
    }
    println!("✓ dissemination and naive allgather agree");
}

#[test]
fn test_alltoall_transposes() {
    let cluster = Cluster::new(4);
    let results = cluster.run(|comm| {
        let outgoing: Vec<(Rank, Rank)> = (0..4).map(|j| (comm.rank(), j)).collect();
        comm.alltoall(&outgoing).unwrap()
    });
    for (j, received) in results.into_iter().enumerate() {
        let expected: Vec<(Rank, Rank)> = (0..4).map(|i| (i, j as Rank)).collect();
        assert_eq!(received, expected);
    }
    println!("✓ alltoall sends item j to rank j");
}

#[test]
fn test_barrier_never_releases_early() {
    let cluster = Cluster::with_settings(8, binomial());
    let entered = AtomicUsize::new(0);
    cluster.run(|comm| {
        if comm.rank() == 6 {
            thread::sleep(Duration::from_millis(150));
        }
        entered.fetch_add(1, Ordering::SeqCst);
        comm.barrier().unwrap();
        assert_eq!(entered.load(Ordering::SeqCst), 8, "rank {} left early", comm.rank());
    });
    println!("✓ nobody leaves the barrier before the last rank enters");
}

#[test]
fn test_back_to_back_collectives_stay_apart() {
    let cluster = Cluster::new(5);
    let results = cluster.run(|comm| {
        (0..20)
            .map(|i| comm.allreduce(comm.rank() + i, Sum).unwrap())
            .collect::<Vec<_>>()
    });
    let expected: Vec<Rank> = (0..20).map(|i| 10 + 5 * i).collect();
    assert!(results.iter().all(|v| *v == expected));
    println!("✓ consecutive collectives do not mix their messages");
}

// =========================================================================
// Communicator management
// =========================================================================

#[test]
fn test_split_by_parity_reversed() {
    let cluster = Cluster::new(6);
    let results = cluster.run(|comm| {
        let sub = comm.comm_split(comm.rank() % 2, -comm.rank()).unwrap().unwrap();
        let members = sub.allgather(&comm.rank()).unwrap();
        let sum = sub.allreduce(comm.rank(), Sum).unwrap();
        (sub.rank(), sub.size(), members, sum, sub.compare(comm))
    });
    for (world_rank, (rank, size, members, sum, cmp)) in results.into_iter().enumerate() {
        assert_eq!(size, 3);
        if world_rank % 2 == 0 {
            assert_eq!(members, vec![4, 2, 0]);
            assert_eq!(sum, 6);
        } else {
            assert_eq!(members, vec![5, 3, 1]);
            assert_eq!(sum, 9);
        }
        assert_eq!(rank, (2 - world_rank / 2) as Rank);
        assert_eq!(cmp, Comparison::Unequal);
    }
    println!("✓ split groups by color and orders by key");
}

#[test]
fn test_split_undefined_opts_out() {
    let cluster = Cluster::new(4);
    let results = cluster.run(|comm| {
        let color = if comm.rank() == 0 { UNDEFINED } else { 1 };
        comm.comm_split(color, 0).unwrap().map(|c| c.size())
    });
    assert_eq!(results, vec![None, Some(3), Some(3), Some(3)]);
    println!("✓ UNDEFINED color yields no communicator");
}

#[test]
fn test_create_dup_and_free() {
    let cluster = Cluster::new(4);
    cluster.run(|comm| {
        let evens = comm.group().incl(&[0, 2]).unwrap();
        let created = comm.comm_create(&evens).unwrap();
        assert_eq!(created.is_some(), comm.rank() % 2 == 0);

        // Ids stay in step even for ranks outside the new group
        let dup = comm.comm_dup().unwrap();
        assert_eq!(dup.compare(comm), Comparison::Congruent);
        assert_eq!(comm.compare(comm), Comparison::Ident);
        assert_ne!(dup.id(), comm.id());
        assert_eq!(dup.allreduce(1, Sum).unwrap(), 4);

        if let Some(sub) = &created {
            assert_ne!(sub.id(), dup.id());
            assert_eq!(sub.allreduce(comm.rank(), Sum).unwrap(), 2);
            sub.comm_free().unwrap();
            assert_eq!(sub.barrier().unwrap_err().code(), Code::Invalid);
        }
        dup.comm_free().unwrap();
        assert_eq!(comm.comm_free().unwrap_err().code(), Code::Invalid);
    });
    println!("✓ create, dup and free keep ids consistent across ranks");
}

#[test]
fn test_create_rejects_foreign_group() {
    let cluster = Cluster::new(2);
    let stranger = tcpmpi::Group::new(
        vec![PeerAddr {
            host: "elsewhere".to_string(),
            port: 1,
            global_rank: 9,
        }],
        0,
    );
    let err = cluster.comms[0].comm_create(&stranger).unwrap_err();
    assert_eq!(err.code(), Code::GroupNotSubset);
    println!("✓ a group outside the communicator is rejected");
}

#[test]
fn test_id_space_runs_out() {
    let cluster = Cluster::new(1);
    let mut comm = cluster.comms[0].clone();
    let mut created = 0;
    let err = loop {
        match comm.comm_dup() {
            Ok(child) => {
                comm = child;
                created += 1;
            }
            Err(e) => break e,
        }
    };
    assert_eq!(err.code(), Code::NoIdAvailable);
    assert_eq!(created, 31);
    println!("✓ nested duplication exhausts the id space after 31 levels");
}

// =========================================================================
// Failures
// =========================================================================

#[test]
fn test_lost_member_aborts_collective() {
    let cluster = Cluster::new(3);
    let comm = cluster.comms[0].clone();
    let waiter = thread::spawn(move || comm.barrier());
    thread::sleep(Duration::from_millis(30));
    cluster.fabric.fail(2);
    let err = waiter.join().unwrap().unwrap_err();
    assert_eq!(err.code(), Code::CollectiveAborted);

    let err = cluster.comms[1].allreduce(1, Sum).unwrap_err();
    assert_eq!(err.code(), Code::CollectiveAborted);
    println!("✓ collectives involving a lost rank fail");
}
