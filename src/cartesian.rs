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

//! Cartesian process grids
//!
//! A grid lays the first `product(dims)` ranks of a communicator out in
//! n dimensions, the first dimension varying fastest: in a 2x2x2 grid rank 4
//! sits at `[0, 0, 1]`. Each dimension is periodic (wraps around) or not.
//! Ranks are never reordered.

use std::fmt;

use crate::communicator::Communicator;
use crate::constants::Rank;
use crate::error::{Code, MpiError, MpiResult};

/// Shape of an n-dimensional grid
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CartesianTopology {
    dims: Vec<usize>,
    periodic: Vec<bool>,
}

impl CartesianTopology {
    /// Validate `dims` and pad `periodic` with `false` up to its length
    pub fn new(dims: &[usize], periodic: &[bool]) -> MpiResult<Self> {
        if dims.is_empty() {
            return Err(MpiError::new(Code::Invalid, "a grid needs at least one dimension"));
        }
        if dims.contains(&0) {
            return Err(MpiError::new(
                Code::Invalid,
                format!("every dimension must be at least 1 wide, got {:?}", dims),
            ));
        }
        if periodic.len() > dims.len() {
            return Err(MpiError::new(
                Code::Invalid,
                format!(
                    "{} periodicity flags for a {}-dimensional grid",
                    periodic.len(),
                    dims.len()
                ),
            ));
        }

        let mut flags = periodic.to_vec();
        flags.resize(dims.len(), false);
        Ok(Self {
            dims: dims.to_vec(),
            periodic: flags,
        })
    }

    pub fn ndims(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn periodic(&self) -> &[bool] {
        &self.periodic
    }

    /// Number of grid positions
    pub fn size(&self) -> usize {
        self.dims.iter().product()
    }

    /// Grid position of `rank`
    pub fn coords(&self, rank: Rank) -> MpiResult<Vec<usize>> {
        if rank < 0 || rank as usize >= self.size() {
            return Err(MpiError::new(
                Code::InvalidRank,
                format!("rank {} is outside the {} grid", rank, self),
            ));
        }
        let mut rest = rank as usize;
        Ok(self
            .dims
            .iter()
            .map(|&d| {
                let c = rest % d;
                rest /= d;
                c
            })
            .collect())
    }

    /// Rank at `coords`, wrapping periodic dimensions
    pub fn rank(&self, coords: &[i64]) -> MpiResult<Rank> {
        if coords.len() != self.dims.len() {
            return Err(MpiError::new(
                Code::Invalid,
                format!("{} coordinates for a {}-dimensional grid", coords.len(), self.dims.len()),
            ));
        }

        let mut rank = 0usize;
        let mut stride = 1usize;
        for (dim, &c) in coords.iter().enumerate() {
            let c = self.normalize(dim, c).ok_or_else(|| {
                MpiError::new(
                    Code::InvalidRank,
                    format!("coordinates {:?} fall outside the {} grid", coords, self),
                )
            })?;
            rank += c * stride;
            stride *= self.dims[dim];
        }
        Ok(rank as Rank)
    }

    /// Move one coordinate `displacement` steps along `direction`
    ///
    /// Periodic dimensions wrap; leaving a non-periodic one is an error.
    pub fn shift_coordinate(&self, direction: usize, displacement: i64, coordinate: i64) -> MpiResult<usize> {
        self.check_direction(direction)?;
        self.normalize(direction, coordinate + displacement).ok_or_else(|| {
            MpiError::new(
                Code::InvalidRank,
                format!(
                    "shifting {} by {} leaves dimension {} of the {} grid",
                    coordinate, displacement, direction, self
                ),
            )
        })
    }

    /// Neighbours of `rank` along `direction`: the rank `displacement` steps
    /// behind it and the one `displacement` steps ahead
    ///
    /// `None` where a non-periodic edge is crossed.
    pub fn shift(&self, rank: Rank, direction: usize, displacement: i64) -> MpiResult<(Option<Rank>, Option<Rank>)> {
        self.check_direction(direction)?;
        let here: Vec<i64> = self.coords(rank)?.into_iter().map(|c| c as i64).collect();

        let neighbour = |step: i64| -> MpiResult<Option<Rank>> {
            let mut there = here.clone();
            there[direction] += step;
            match self.normalize(direction, there[direction]) {
                Some(_) => self.rank(&there).map(Some),
                None => Ok(None),
            }
        };
        Ok((neighbour(-displacement)?, neighbour(displacement)?))
    }

    fn check_direction(&self, direction: usize) -> MpiResult<()> {
        if direction >= self.dims.len() {
            return Err(MpiError::new(
                Code::Invalid,
                format!("direction {} on a {}-dimensional grid", direction, self.dims.len()),
            ));
        }
        Ok(())
    }

    fn normalize(&self, dim: usize, c: i64) -> Option<usize> {
        let width = self.dims[dim] as i64;
        if self.periodic[dim] {
            Some(c.rem_euclid(width) as usize)
        } else if (0..width).contains(&c) {
            Some(c as usize)
        } else {
            None
        }
    }
}

impl fmt::Display for CartesianTopology {
    /// `10Px20Px30`: widths joined by `x`, periodic ones marked `P`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (d, p)) in self.dims.iter().zip(&self.periodic).enumerate() {
            if i > 0 {
                write!(f, "x")?;
            }
            write!(f, "{}{}", d, if *p { "P" } else { "" })?;
        }
        Ok(())
    }
}

/// A communicator with a grid attached
#[derive(Debug, Clone)]
pub struct CartesianComm {
    comm: Communicator,
    topology: CartesianTopology,
}

impl CartesianComm {
    pub fn comm(&self) -> &Communicator {
        &self.comm
    }

    pub fn topology(&self) -> &CartesianTopology {
        &self.topology
    }

    /// Whether the calling rank has a grid position
    pub fn in_grid(&self) -> bool {
        (self.comm.rank() as usize) < self.topology.size()
    }

    /// Grid position of the calling rank
    pub fn coords(&self) -> MpiResult<Vec<usize>> {
        self.topology.coords(self.comm.rank())
    }

    pub fn coords_of(&self, rank: Rank) -> MpiResult<Vec<usize>> {
        self.topology.coords(rank)
    }

    pub fn rank_of(&self, coords: &[i64]) -> MpiResult<Rank> {
        self.topology.rank(coords)
    }

    /// Source and destination for a shift of the calling rank
    pub fn shift(&self, direction: usize, displacement: i64) -> MpiResult<(Option<Rank>, Option<Rank>)> {
        self.topology.shift(self.comm.rank(), direction, displacement)
    }
}

impl Communicator {
    /// Lay this communicator's ranks out on a grid
    ///
    /// Ranks beyond `product(dims)` stay members of the communicator but
    /// have no grid position.
    pub fn cartesian(&self, dims: &[usize], periodic: &[bool]) -> MpiResult<CartesianComm> {
        let topology = CartesianTopology::new(dims, periodic)?;
        if topology.size() > self.size() {
            return Err(MpiError::new(
                Code::Invalid,
                format!(
                    "a {} grid needs {} ranks, the communicator has {}",
                    topology,
                    topology.size(),
                    self.size()
                ),
            ));
        }
        log::debug!("communicator {} laid out as a {} grid", self.id(), topology);
        Ok(CartesianComm {
            comm: self.clone(),
            topology,
        })
    }
}

/// Balanced grid dimensions for `nnodes` ranks in `ndims` dimensions
///
/// Non-zero entries of `constraints` are kept; the zero ones are filled so
/// their product makes up the rest, as evenly as the prime factors allow,
/// largest first. An empty `constraints` leaves every dimension free.
pub fn dims_create(nnodes: usize, ndims: usize, constraints: &[usize]) -> MpiResult<Vec<usize>> {
    if nnodes == 0 || ndims == 0 {
        return Err(MpiError::new(
            Code::Invalid,
            format!("cannot lay out {} ranks in {} dimensions", nnodes, ndims),
        ));
    }
    let mut dims = if constraints.is_empty() {
        vec![0; ndims]
    } else if constraints.len() == ndims {
        constraints.to_vec()
    } else {
        return Err(MpiError::new(
            Code::Invalid,
            format!("{} constraints for {} dimensions", constraints.len(), ndims),
        ));
    };

    let fixed: usize = dims.iter().filter(|&&d| d != 0).product();
    if nnodes % fixed != 0 {
        return Err(MpiError::new(
            Code::Invalid,
            format!("{} ranks cannot fill the fixed dimensions {:?}", nnodes, dims),
        ));
    }
    let free: Vec<usize> = (0..ndims).filter(|&i| dims[i] == 0).collect();
    let remaining = nnodes / fixed;
    if free.is_empty() {
        if remaining != 1 {
            return Err(MpiError::new(
                Code::Invalid,
                format!("dimensions {:?} do not hold {} ranks", dims, nnodes),
            ));
        }
        return Ok(dims);
    }

    // Largest factors first, each onto the currently smallest free dimension
    let mut sizes = vec![1usize; free.len()];
    for factor in prime_factors(remaining).into_iter().rev() {
        if let Some(smallest) = sizes.iter_mut().min() {
            *smallest *= factor;
        }
    }
    sizes.sort_unstable_by(|a, b| b.cmp(a));
    for (slot, size) in free.into_iter().zip(sizes) {
        dims[slot] = size;
    }
    Ok(dims)
}

/// Prime factors in ascending order, with repetition
fn prime_factors(mut n: usize) -> Vec<usize> {
    let mut factors = Vec::new();
    let mut p = 2;
    while p * p <= n {
        while n % p == 0 {
            factors.push(p);
            n /= p;
        }
        p += 1;
    }
    if n > 1 {
        factors.push(n);
    }
    factors
}
