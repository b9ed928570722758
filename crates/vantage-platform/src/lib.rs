// SPDX-License-Identifier: CEPL-1.0
//! Windowing boundary. The app reaches winit only through this crate.
pub use winit;
