//! PaintCore: a layered, animated raster drawing engine.
//!
//! The canvas lives behind a [`canvas::ChunkLock`] shared by the
//! interactive [`project::Project`] and the background workers.  Every
//! edit is recorded in [`components::history::History`] so it can be
//! undone and redone.

#![allow(clippy::too_many_arguments)]
#![allow(clippy::type_complexity)]

pub mod logger;

pub mod blend;
pub mod canvas;
pub mod cli;
pub mod color;
pub mod components;
pub mod error;
pub mod io;
pub mod ops;
pub mod project;
pub mod selection;
pub mod settings;
pub mod worker;

pub use canvas::{CanvasState, ChunkLock};
pub use color::Color;
pub use error::{EngineError, Result};
pub use project::Project;
