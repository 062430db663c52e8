//! Silicon model for ESP loosely-coupled accelerator tiles.
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of the accelerator socket: register offsets and bit
//! definitions, coherence modes, accelerator identifiers and the platform
//! address map.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`regs`] | Accelerator socket register map, command/status bits |
//! | [`coherence`] | Coherence modes and the host flush each one requires |
//! | [`devices`] | Accelerator kinds, device IDs, compatible strings |
//! | [`socmap`] | Platform address map and bus/chunk geometry |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod coherence;
pub mod devices;
pub mod regs;
pub mod socmap;
