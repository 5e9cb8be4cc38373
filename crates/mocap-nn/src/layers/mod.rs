// SPDX-License-Identifier: AGPL-3.0-or-later

pub mod leaky_relu;
pub mod linear;
pub mod lstm;

pub use leaky_relu::LeakyRelu;
pub use linear::Linear;
pub use lstm::Lstm;
