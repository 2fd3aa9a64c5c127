pub mod canvas_ops;
pub mod transform;
