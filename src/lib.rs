//! # bc-backend
//!
//! The compiler backend for a Toit-like bytecode language: takes a fully
//! resolved program IR and turns it into a program image plus debug-info
//! source map. The front end (parsing, name resolution, type checking) and
//! the real image serializer/runtime are both out of scope (§1) — this
//! crate owns everything from "resolved IR" to "bytecode written through a
//! `ProgramImageSink`".
//!
//! ```text
//! Program (IR) → stub synthesis → dispatch-table build → IR walk → image
//!                     [MODULE]          [MODULE]          [MODULE]
//! ```
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use bc_backend::config::BackendConfig;
//! use bc_backend::image::{RecordingImage, RecordingSourceMap};
//! use bc_backend::ir::Program;
//!
//! let mut program = Program::default();
//! let config = BackendConfig::load();
//! let mut image = RecordingImage::default();
//! let mut source_map = RecordingSourceMap::default();
//!
//! let summary = bc_backend::driver::run(&mut program, &config, &mut image, &mut source_map)?;
//! println!("{} methods emitted", summary.methods_emitted);
//! # Ok::<(), bc_backend::error::BackendError>(())
//! ```

pub mod bytecode;
pub mod config;
pub mod dispatch;
pub mod driver;
pub mod emitter;
pub mod error;
pub mod image;
pub mod ir;
pub mod shape;
pub mod stub;
pub mod walker;

pub use driver::{run, FinishedImage};
pub use error::{BackendError, BackendResult};
