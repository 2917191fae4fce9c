pub mod device;
pub mod elements;
pub mod registry;
pub mod spec;
pub mod text_ir;
