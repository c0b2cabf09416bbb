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

//! Reduction operators
//!
//! An operator folds a list of values into one. Operators that are
//! associative and commutative declare `partial_reducible()`, which lets
//! interior tree nodes fold their subtree before forwarding. Everything else
//! has its values carried to the root keyed by rank and folded there in rank
//! order.

use std::cmp::Ordering;

use num_traits::{Num, NumCast, One, Zero};

use crate::error::{Code, MpiError, MpiResult};

pub trait ReduceOp<T>: Send + Sync {
    fn reduce(&self, values: Vec<T>) -> MpiResult<T>;

    fn partial_reducible(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "custom"
    }
}

fn empty_input(op: &str) -> MpiError {
    MpiError::new(Code::Invalid, format!("{} over an empty list", op))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sum;

impl<T: Zero + Send> ReduceOp<T> for Sum {
    fn reduce(&self, values: Vec<T>) -> MpiResult<T> {
        Ok(values.into_iter().fold(T::zero(), |acc, v| acc + v))
    }

    fn partial_reducible(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "sum"
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Prod;

impl<T: One + Send> ReduceOp<T> for Prod {
    fn reduce(&self, values: Vec<T>) -> MpiResult<T> {
        Ok(values.into_iter().fold(T::one(), |acc, v| acc * v))
    }

    fn partial_reducible(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "prod"
    }
}

fn pick<T: PartialOrd>(values: Vec<T>, keep: Ordering, op: &str) -> MpiResult<T> {
    let mut iter = values.into_iter();
    let first = iter.next().ok_or_else(|| empty_input(op))?;
    Ok(iter.fold(first, |best, v| {
        if v.partial_cmp(&best) == Some(keep) {
            v
        } else {
            best
        }
    }))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Max;

impl<T: PartialOrd + Send> ReduceOp<T> for Max {
    fn reduce(&self, values: Vec<T>) -> MpiResult<T> {
        pick(values, Ordering::Greater, "max")
    }

    fn partial_reducible(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "max"
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Min;

impl<T: PartialOrd + Send> ReduceOp<T> for Min {
    fn reduce(&self, values: Vec<T>) -> MpiResult<T> {
        pick(values, Ordering::Less, "min")
    }

    fn partial_reducible(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "min"
    }
}

/// Arithmetic mean; an average of averages is wrong, so never partial
#[derive(Debug, Clone, Copy, Default)]
pub struct Avg;

impl<T: Num + NumCast + Copy + Send> ReduceOp<T> for Avg {
    fn reduce(&self, values: Vec<T>) -> MpiResult<T> {
        if values.is_empty() {
            return Err(empty_input("avg"));
        }
        let count: T = NumCast::from(values.len())
            .ok_or_else(|| MpiError::new(Code::Invalid, "avg: count does not fit the value type"))?;
        let total = values.into_iter().fold(T::zero(), |acc, v| acc + v);
        Ok(total / count)
    }

    fn name(&self) -> &'static str {
        "avg"
    }
}

/// Operator from a closure over the whole list
pub struct FnOp<F> {
    f: F,
    partial: bool,
}

impl<F> FnOp<F> {
    /// Values are folded at the root only, in rank order
    pub fn new(f: F) -> Self {
        Self { f, partial: false }
    }

    /// The closure is associative and commutative
    pub fn partial(f: F) -> Self {
        Self { f, partial: true }
    }
}

impl<T, F> ReduceOp<T> for FnOp<F>
where
    F: Fn(Vec<T>) -> T + Send + Sync,
{
    fn reduce(&self, values: Vec<T>) -> MpiResult<T> {
        Ok((self.f)(values))
    }

    fn partial_reducible(&self) -> bool {
        self.partial
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_folds() {
        assert_eq!(ReduceOp::<i64>::reduce(&Sum, vec![1, 2, 3]).unwrap(), 6);
        assert_eq!(ReduceOp::<i64>::reduce(&Prod, vec![2, 3, 4]).unwrap(), 24);
        assert_eq!(ReduceOp::<f64>::reduce(&Max, vec![1.5, -2.0, 7.25]).unwrap(), 7.25);
        assert_eq!(ReduceOp::<i32>::reduce(&Min, vec![4, -9, 3]).unwrap(), -9);
        assert_eq!(ReduceOp::<f64>::reduce(&Avg, vec![1.0, 2.0, 6.0]).unwrap(), 3.0);
        assert!(ReduceOp::<i32>::reduce(&Max, Vec::new()).is_err());
    }

    #[test]
    fn only_declared_operators_are_partial() {
        assert!(ReduceOp::<i32>::partial_reducible(&Sum));
        assert!(!ReduceOp::<f64>::partial_reducible(&Avg));
        let concat = FnOp::new(|v: Vec<String>| v.concat());
        assert!(!ReduceOp::<String>::partial_reducible(&concat));
        let joined = ReduceOp::<String>::reduce(&concat, vec!["a".to_string(), "b".to_string()]).unwrap();
        assert_eq!(joined, "ab");
        assert!(ReduceOp::<i32>::partial_reducible(&FnOp::partial(|v: Vec<i32>| v.into_iter().sum())));
    }
}
