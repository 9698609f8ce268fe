// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! ASIC backends for the chassis manager.
//!
//! The stub backend is always built, as it is also the foundation of the
//! chaos backend.  Building with the `chaos` feature makes the chaos backend
//! the default `Handle`.

pub mod stub;

#[cfg(not(feature = "chaos"))]
mod plat {
    pub use super::stub::AsicConfig;
    pub use super::stub::StubHandle as Handle;
}

#[cfg(feature = "chaos")]
pub mod chaos;
#[cfg(feature = "chaos")]
mod plat {
    pub use super::chaos::AsicConfig;
    pub use super::chaos::Handle;
}

pub use plat::AsicConfig;
pub use plat::Handle;
