pub mod destroy;
pub mod outputs;
pub mod plan;
pub mod render;
pub mod up;
