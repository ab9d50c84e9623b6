// Modified version of relax.rs from spin-rs to support Loom yielding.
//
// Original file at its most recent change (at the time of writing):
// https://github.com/mvdnes/spin-rs/blob/5860ee114094cf200b97348ff332155fbd7159b4/src/relax.rs
//
// Copyright (c) 2014 Mathijs van de Nes
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Strategies run by the engine while it waits without parking.
//!
//! The engine only busy-waits in two places: a timed acquire whose remaining
//! time is below the spin threshold, and a condition waiter that lost the
//! transfer race against `signal` and is waiting for the signaller to finish
//! enqueueing its node.

use crate::cfg::{hint, thread};

/// A trait implemented by spinning relax strategies.
pub(crate) trait Relax {
    /// Initialize the state for the relaxing operation, if any.
    fn new() -> Self;

    /// Perform the relaxing operation during a period of contention.
    fn relax(&mut self);
}

/// A strategy that rapidly spins while informing the CPU that it should power
/// down non-essential components via [`core::hint::spin_loop`].
///
/// Only used for waits that are known to be shorter than the cost of a timed
/// park.
pub(crate) struct Spin;

impl Relax for Spin {
    #[inline(always)]
    fn new() -> Self {
        Self
    }

    #[inline(always)]
    fn relax(&mut self) {
        hint::spin_loop();
    }
}

/// A strategy that yields the current time slice to the scheduler in favour of
/// other threads.
///
/// Under Loom this calls Loom's `yield_now`, which tells the model that
/// another thread needs to be scheduled for the current one to make progress.
pub(crate) struct Yield;

impl Relax for Yield {
    #[inline(always)]
    fn new() -> Self {
        Self
    }

    #[inline]
    fn relax(&mut self) {
        thread::yield_now();
    }
}

/// Relaxes with `R` until `cond` returns `true`.
pub(crate) fn relax_until<R: Relax, F: FnMut() -> bool>(mut cond: F) {
    let mut relax = R::new();
    while !cond() {
        relax.relax();
    }
}
